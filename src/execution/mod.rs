pub mod position_sizer;
pub mod retry;
pub mod trade_executor;

pub use trade_executor::{CloseOutcome, ExecutionOutcome, ReconcileOutcome, SweepReport, TradeExecutor};
