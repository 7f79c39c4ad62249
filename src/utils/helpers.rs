//! Helper functions

pub fn format_percentage(pct: f64) -> String {
    format!("{:.4}%", pct)
}

pub fn format_usd(amount: f64) -> String {
    if amount.abs() >= 1_000_000.0 {
        format!("${:.2}M", amount / 1_000_000.0)
    } else if amount.abs() >= 1_000.0 {
        format!("${:.2}K", amount / 1_000.0)
    } else {
        format!("${:.2}", amount)
    }
}

pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 { 0.0 } else { numerator / denominator }
}

/// Fraction of `total` that `part` represents, as a percentage
pub fn pct_of(part: f64, total: f64) -> f64 {
    safe_div(part, total) * 100.0
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(12.3), "$12.30");
        assert_eq!(format_usd(1_234.0), "$1.23K");
        assert_eq!(format_usd(2_500_000.0), "$2.50M");
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(10.0, 2.0), 5.0);
        assert_eq!(safe_div(10.0, 0.0), 0.0);
    }

    #[test]
    fn test_pct_of() {
        assert!((pct_of(750.0, 10_000.0) - 7.5).abs() < 1e-9);
        assert_eq!(pct_of(1.0, 0.0), 0.0);
    }
}
