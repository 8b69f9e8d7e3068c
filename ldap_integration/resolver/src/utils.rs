use std::cmp::Ordering;

/// Split into alternating runs of digits and non-digits.
fn chunks(s: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digit = None;
    for (idx, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digit {
            Some(d) if d != is_digit => {
                out.push((d, &s[start..idx]));
                start = idx;
            }
            _ => {}
        }
        digit = Some(is_digit);
    }
    if let Some(d) = digit {
        out.push((d, &s[start..]));
    }
    out
}

fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
}

/// Order strings the way a person would: case-insensitively, with runs of
/// digits compared by value, so `user2` sorts before `user10`. Strings that
/// compare equal this way are ordered bytewise so the order is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let ach = chunks(&a_lower);
    let bch = chunks(&b_lower);

    for ((a_digit, a_part), (b_digit, b_part)) in ach.iter().zip(bch.iter()) {
        let ord = if *a_digit && *b_digit {
            cmp_numeric(a_part, b_part)
        } else {
            a_part.cmp(b_part)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ach.len().cmp(&bch.len()).then_with(|| a.cmp(b))
}

/// Remove duplicates and sort naturally.
pub fn natural_sort_dedup(mut names: Vec<String>) -> Vec<String> {
    names.sort_by(|a, b| natural_cmp(a, b));
    names.dedup();
    names
}

/// Apply a `limit`/`offset` window. `None` is unlimited.
pub fn window<T>(items: Vec<T>, limit: Option<usize>, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(l) => iter.take(l).collect(),
        None => iter.collect(),
    }
}
