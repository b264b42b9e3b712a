// Risk management: policy, pre-trade checks and the periodic position sweep
pub mod drawdown;
pub mod evaluator;
pub mod monitor;
pub mod policy;

pub use drawdown::{DrawdownSnapshot, DrawdownTracker};
pub use evaluator::{
    ExitDirective, ExposureReservation, PreTradeDecision, PriceBook, RiskEvaluator, RiskRule,
    SweepReport, TradeCandidate,
};
pub use monitor::{MonitorStats, RiskMonitor, SweepRecord, TriggerRecord};
pub use policy::{
    DrawdownConfig, ExposureConfig, RiskPolicy, StopLossConfig, TakeProfitConfig,
    TrailingStopConfig,
};
