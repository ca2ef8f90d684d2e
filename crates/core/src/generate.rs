//! Random names and passwords for resources created on behalf of a parent.

use rand::rngs::OsRng;
use rand::Rng;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+<>?[]{}";
const NAME_SUFFIX_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("invalid password length: {0}")]
    InvalidLength(usize),
}

fn sample(charset: &[u8], n: usize) -> String {
    let mut rng = OsRng;
    (0..n)
        .map(|_| char::from(charset[rng.gen_range(0..charset.len())]))
        .collect()
}

/// `"{prefix}-xxxxx"` with a random lowercase alphanumeric suffix.
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{}", prefix, sample(NAME_ALPHABET, NAME_SUFFIX_LEN))
}

pub fn generate_password(n: usize) -> Result<String, GenerateError> {
    if n == 0 {
        return Err(GenerateError::InvalidLength(n));
    }
    Ok(sample(PASSWORD_CHARSET, n))
}
