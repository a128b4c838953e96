/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const fn price(input_per_million: f64, output_per_million: f64) -> ModelPrice {
    ModelPrice {
        input_per_million,
        output_per_million,
    }
}

/// Charged for any model missing from the table.
pub const FALLBACK_PRICE: ModelPrice = price(3.0, 15.0);

static PRICE_TABLE: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", price(15.0, 75.0)),
    ("claude-sonnet-4", price(3.0, 15.0)),
    ("claude-3-7-sonnet", price(3.0, 15.0)),
    ("claude-3-5-sonnet", price(3.0, 15.0)),
    ("claude-3-5-haiku", price(0.8, 4.0)),
    ("claude-haiku-4", price(1.0, 5.0)),
    ("claude-3-haiku", price(0.25, 1.25)),
    ("gpt-4o-mini", price(0.15, 0.6)),
    ("gpt-4o", price(2.5, 10.0)),
    ("gpt-4.1-mini", price(0.4, 1.6)),
    ("gpt-4.1", price(2.0, 8.0)),
];

/// Strip a `provider/` prefix such as `anthropic/claude-sonnet-4`.
fn strip_provider(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

/// Exact id match first, then the longest table entry that prefixes the id
/// (dated snapshots like `claude-sonnet-4-20250514`), then the fallback.
pub fn price_for(model: &str) -> ModelPrice {
    let id = strip_provider(model.trim()).to_lowercase();
    if let Some((_, p)) = PRICE_TABLE.iter().find(|(name, _)| *name == id) {
        return *p;
    }
    PRICE_TABLE
        .iter()
        .filter(|(name, _)| id.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, p)| *p)
        .unwrap_or(FALLBACK_PRICE)
}

pub fn cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = price_for(model);
    (input_tokens as f64 / 1_000_000.0) * p.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * p.output_per_million
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_prefix_is_ignored() {
        assert_eq!(
            price_for("anthropic/claude-3-haiku"),
            price_for("claude-3-haiku")
        );
    }

    #[test]
    fn dated_snapshot_uses_longest_prefix() {
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), price(0.15, 0.6));
        assert_eq!(price_for("claude-sonnet-4-20250514"), price(3.0, 15.0));
    }

    #[test]
    fn unknown_model_falls_back_to_mid_tier() {
        assert_eq!(price_for("llama3.1:8b"), FALLBACK_PRICE);
    }

    #[test]
    fn cost_is_linear_in_tokens() {
        let c = cost_usd("claude-opus-4", 1_000_000, 1_000_000);
        assert!((c - 90.0).abs() < 1e-9);
    }
}
