use polars::prelude::DataFrame;

use crate::{data::BarData, error::TradesimResult, sim::context::Context};

/// The user-supplied trading logic: an opaque pair of callbacks plus two
/// optional hooks.
///
/// Strategy-local state that scheduled functions must see belongs in
/// `ctx.state`, the string-keyed side map, rather than in `self`.
pub trait Strategy {
    /// Called once before the first bar. All configuration APIs (ordering
    /// controls, slippage/commission, schedule_function, benchmark) are
    /// available; market data is not.
    fn initialize(&mut self, _ctx: &mut Context<'_>) -> TradesimResult<()> {
        Ok(())
    }

    /// Called once per Bar event with the current market data view.
    fn handle_data(&mut self, ctx: &mut Context<'_>, data: &BarData<'_>) -> TradesimResult<()>;

    /// Called once per session, ahead of the open. Placing orders here
    /// fails.
    fn before_trading_start(
        &mut self,
        _ctx: &mut Context<'_>,
        _data: &BarData<'_>,
    ) -> TradesimResult<()> {
        Ok(())
    }

    /// Called after the run with the final performance frame.
    fn analyze(&mut self, _perf: &DataFrame) -> TradesimResult<()> {
        Ok(())
    }
}

impl Strategy for Box<dyn Strategy> {
    fn initialize(&mut self, ctx: &mut Context<'_>) -> TradesimResult<()> {
        (**self).initialize(ctx)
    }

    fn handle_data(&mut self, ctx: &mut Context<'_>, data: &BarData<'_>) -> TradesimResult<()> {
        (**self).handle_data(ctx, data)
    }

    fn before_trading_start(
        &mut self,
        ctx: &mut Context<'_>,
        data: &BarData<'_>,
    ) -> TradesimResult<()> {
        (**self).before_trading_start(ctx, data)
    }

    fn analyze(&mut self, perf: &DataFrame) -> TradesimResult<()> {
        (**self).analyze(perf)
    }
}
