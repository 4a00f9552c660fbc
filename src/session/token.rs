use rand::distributions::Alphanumeric;
use rand::Rng;

/// Source of session tokens. Implementations should draw uniformly from an alphanumeric alphabet
///  so that collisions are negligible - the session table still checks for uniqueness among the
///  tokens currently in use.
#[cfg_attr(test, mockall::automock)]
pub trait TokenGenerator: Send + Sync + 'static {
    fn generate(&self, length: usize) -> String;
}

/// Tokens of `[0-9A-Za-z]` drawn from the thread-local RNG
#[derive(Debug, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self, length: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashSet;
    use super::*;

    #[rstest]
    #[case::empty(0)]
    #[case::default(8)]
    #[case::long(64)]
    fn test_random_token(#[case] length: usize) {
        let token = RandomTokenGenerator.generate(length);
        assert_eq!(token.len(), length);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_tokens_differ() {
        let tokens: FxHashSet<String> = (0..1000)
            .map(|_| RandomTokenGenerator.generate(8))
            .collect();
        assert_eq!(tokens.len(), 1000);
    }
}
