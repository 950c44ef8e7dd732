use bigdecimal::{BigDecimal, RoundingMode};

pub trait BigDecimalHelpers {
    /// `percent` of the amount, rounded half-up to cents.
    fn percent_of(&self, percent: u32) -> BigDecimal;

    fn to_cents_string(&self) -> String;
}

impl BigDecimalHelpers for BigDecimal {
    fn percent_of(&self, percent: u32) -> BigDecimal {
        (self * BigDecimal::from(percent) / BigDecimal::from(100)).with_scale_round(2, RoundingMode::HalfUp)
    }

    fn to_cents_string(&self) -> String {
        self.with_scale_round(2, RoundingMode::HalfUp).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_platform_fee() {
        assert_eq!(dec("150.00").percent_of(3), dec("4.50"));
        assert_eq!(dec("10.15").percent_of(3), dec("0.30"));
        assert_eq!(dec("0.50").percent_of(3), dec("0.02"));
        assert_eq!(dec("99.99").percent_of(0), dec("0.00"));
    }

    #[test]
    fn test_cents_string() {
        assert_eq!(dec("150").to_cents_string(), "150.00");
        assert_eq!(dec("1.005").to_cents_string(), "1.01");
    }
}
