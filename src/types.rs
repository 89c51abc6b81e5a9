// =============================================================================
// Shared types used across the momentum-gate trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Engine lifecycle state. `Error` and `KillSwitchActivated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    KillSwitchActivated,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
            Self::KillSwitchActivated => write!(f, "KillSwitchActivated"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Neutral order status. The broker reports status as localized text on the
/// order-update feed; [`OrderStatus::from_status_text`] is the single place
/// that mapping happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Accepted,
    PartialFill,
    Fill,
    Cancelled,
    Rejected,
    Modified,
}

impl OrderStatus {
    /// Map the broker's localized status string to the neutral enum.
    ///
    /// `확인` (confirm) arrives on the same terminal path as cancellations and
    /// is treated as `Cancelled`, matching how the venue reports it.
    pub fn from_status_text(text: &str) -> Option<Self> {
        match text.trim() {
            "접수" => Some(Self::Accepted),
            "체결" => Some(Self::Fill),
            "취소" | "확인" => Some(Self::Cancelled),
            "거부" => Some(Self::Rejected),
            "정정" => Some(Self::Modified),
            _ => None,
        }
    }

    /// True for statuses that terminate a pending order without further fills.
    pub fn is_terminal_without_fill(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Rejected | Self::Modified)
    }
}

/// Reason code attached to an exit order, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitSignal {
    HaltStop,
    TimeStop,
    TakeProfit,
    StopLoss,
    EmaCrossSell,
    VwapBreakSell,
    PartialTakeProfit,
    KillSwitch,
}

impl ExitSignal {
    /// Whether this signal liquidates the whole remaining position.
    pub fn is_full_exit(&self) -> bool {
        !matches!(self, Self::PartialTakeProfit)
    }
}

impl std::fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HaltStop => write!(f, "HaltStop"),
            Self::TimeStop => write!(f, "TimeStop"),
            Self::TakeProfit => write!(f, "TakeProfit"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::EmaCrossSell => write!(f, "EmaCrossSell"),
            Self::VwapBreakSell => write!(f, "VwapBreakSell"),
            Self::PartialTakeProfit => write!(f, "PartialTakeProfit"),
            Self::KillSwitch => write!(f, "KillSwitch"),
        }
    }
}

/// Normalize a raw symbol from any external payload.
///
/// Strips a single leading market prefix letter (`A005930` → `005930`) and
/// anything from the first underscore onward (venue suffixes such as `_NX`
/// and `_AL`). Every ingress from the broker goes through this function.
pub fn normalize_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_suffix = trimmed.split('_').next().unwrap_or(trimmed);
    let mut chars = without_suffix.chars();
    match chars.next() {
        Some(first)
            if first.is_ascii_alphabetic()
                && chars.clone().next().is_some_and(|c| c.is_ascii_digit()) =>
        {
            chars.as_str().to_string()
        }
        _ => without_suffix.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_market_prefix() {
        assert_eq!(normalize_symbol("A005930"), "005930");
    }

    #[test]
    fn normalize_strips_venue_suffix() {
        assert_eq!(normalize_symbol("005930_NX"), "005930");
        assert_eq!(normalize_symbol("A005930_AL"), "005930");
    }

    #[test]
    fn normalize_leaves_plain_codes_alone() {
        assert_eq!(normalize_symbol("005930"), "005930");
        assert_eq!(normalize_symbol("  035720 "), "035720");
    }

    #[test]
    fn normalize_does_not_eat_alphabetic_tickers() {
        // A leading letter is only a market prefix when followed by digits.
        assert_eq!(normalize_symbol("AAPL"), "AAPL");
    }

    #[test]
    fn status_text_mapping() {
        assert_eq!(
            OrderStatus::from_status_text("체결"),
            Some(OrderStatus::Fill)
        );
        assert_eq!(
            OrderStatus::from_status_text(" 접수 "),
            Some(OrderStatus::Accepted)
        );
        assert_eq!(
            OrderStatus::from_status_text("취소"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            OrderStatus::from_status_text("확인"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            OrderStatus::from_status_text("거부"),
            Some(OrderStatus::Rejected)
        );
        assert_eq!(OrderStatus::from_status_text("???"), None);
    }

    #[test]
    fn full_exit_classification() {
        assert!(!ExitSignal::PartialTakeProfit.is_full_exit());
        assert!(ExitSignal::TakeProfit.is_full_exit());
        assert!(ExitSignal::HaltStop.is_full_exit());
        assert!(ExitSignal::KillSwitch.is_full_exit());
    }
}
