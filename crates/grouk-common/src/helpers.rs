/// Compare two secrets without short-circuiting on the first differing byte.
///
/// Lengths are not hidden.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |diff, (lhs, rhs)| diff | (lhs ^ rhs)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_tokens_match() {
        assert!(constant_time_eq("Bearer s3cret", "Bearer s3cret"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn any_difference_fails() {
        assert!(!constant_time_eq("Bearer s3cret", "Bearer s3cres"));
        assert!(!constant_time_eq("Bearer", "Bearer s3cret"));
        assert!(!constant_time_eq("x", ""));
    }
}
