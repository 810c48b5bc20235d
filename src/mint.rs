use chrono::Utc;
use rand::Rng;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn base36_upper(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_else(|_| "0".to_string())
}

fn hex_segment(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let nibble: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(nibble), 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
        .collect()
}

/// Stateless, thread-safe generator for account numbers and transaction ids
/// (§4.1 and §6.2). Uniqueness is probabilistic here; the stores enforce it
/// with a hard unique index on insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierMint;

impl IdentifierMint {
    pub fn new() -> Self {
        Self
    }

    /// `ACCT-XXXX-XXXX-XXXX`, 12 upper-case hex chars grouped in fours.
    pub fn mint_account_number(&self) -> String {
        format!(
            "ACCT-{}-{}-{}",
            hex_segment(4),
            hex_segment(4),
            hex_segment(4)
        )
    }

    /// `{PREFIX}-{T}-{R}` where `T` is base-36 wall-clock millis and `R` is
    /// 8 upper-case hex chars.
    pub fn mint_transaction_id(&self, prefix: &str) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        format!("{prefix}-{}-{}", base36_upper(millis), hex_segment(8))
    }
}
