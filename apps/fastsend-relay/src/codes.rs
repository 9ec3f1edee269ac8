use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const CODE_LEN: usize = 4;

/// Source of candidate pairing codes.
pub trait CodeGenerator: Send {
    fn generate(&mut self) -> String;
}

pub struct RandomCodes {
    rng: StdRng,
}

impl RandomCodes {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for RandomCodes {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator for RandomCodes {
    fn generate(&mut self) -> String {
        (0..CODE_LEN)
            .map(|_| char::from(b'0' + self.rng.gen_range(0..10u8)))
            .collect()
    }
}

/// Exactly four ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|byte| byte.is_ascii_digit())
}

/// Draws up to `attempts` fresh codes and returns the first one not `taken`.
pub fn allocate(
    codes: &mut dyn CodeGenerator,
    attempts: usize,
    taken: impl Fn(&str) -> bool,
) -> Option<String> {
    (0..attempts)
        .map(|_| codes.generate())
        .find(|code| !taken(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sequence(Vec<&'static str>);

    impl CodeGenerator for Sequence {
        fn generate(&mut self) -> String {
            self.0.remove(0).to_string()
        }
    }

    #[test_timeout::timeout]
    fn random_codes_are_four_digits() {
        let mut codes = RandomCodes::new();
        for _ in 0..1_000 {
            let code = codes.generate();
            assert!(is_valid_code(&code), "bad code {code}");
        }
    }

    #[test_timeout::timeout]
    fn validation_rejects_non_digits() {
        assert!(is_valid_code("0042"));
        assert!(!is_valid_code("042"));
        assert!(!is_valid_code("00420"));
        assert!(!is_valid_code("12a4"));
        assert!(!is_valid_code("١٢٣٤"));
    }

    #[test_timeout::timeout]
    fn allocate_redraws_on_collision() {
        let mut codes = Sequence(vec!["1111", "1111", "2222"]);
        let code = allocate(&mut codes, 5, |code| code == "1111");
        assert_eq!(code.as_deref(), Some("2222"));
    }

    #[test_timeout::timeout]
    fn allocate_gives_up_after_attempts() {
        let mut codes = Sequence(vec!["1111"; 3]);
        assert_eq!(allocate(&mut codes, 3, |_| true), None);
    }
}
