use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const ID_LEN: usize = 12;

/// Opaque 12-character URL-safe id (§3 "Memory" identity).
pub fn new_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_twelve_chars() {
        let id = new_id();
        assert_eq!(id.chars().count(), ID_LEN);
    }

    #[test]
    fn ids_are_url_safe() {
        let id = new_id();
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn ids_are_unlikely_to_collide() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
