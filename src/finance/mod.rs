pub mod blotter;
pub mod commission;
pub mod controls;
pub mod ledger;
pub mod order;
pub mod position;
pub mod slippage;

pub use blotter::{Blotter, CancelPolicy, CommissionEvent};
pub use commission::{CommissionModel, PerDollar, PerShare, PerTrade};
pub use controls::{
    AccountControl, ControlSet, ErrorPolicy, OrderValidationCtx, TradingControl,
};
pub use ledger::{Account, AccountField, CapitalChange, Ledger, Portfolio};
pub use order::{ExecutionStyle, Order, OrderId, OrderStatus, Transaction};
pub use position::{Position, PositionStats, PositionTracker};
pub use slippage::{Fill, FixedBasisPointsSlippage, NoSlippage, SlippageModel, VolumeShareSlippage};
