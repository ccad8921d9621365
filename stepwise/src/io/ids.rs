//! Run and transaction identifiers.

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

/// `<prefix>-<UTC yyyymmdd_hhmmss>-<6 lowercase alphanumerics>`.
pub fn generate_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        generate_short_id()
    )
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
