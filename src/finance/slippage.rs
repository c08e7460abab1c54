use crate::{data::Bar, finance::order::Order};

/// A partial or full fill produced by a slippage model for one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub amount: i64,
}

/// Decides the fill price and volume an order achieves against a bar.
///
/// Contract: the returned amount must not exceed the order's remaining and
/// carries the same sign; `None` means no fill this bar. Models never see
/// untriggered limit/stop orders; the blotter gates those first.
/// `bar_volume_consumed` is the volume already taken out of this bar by
/// earlier orders on the same asset, so volume caps hold across orders.
pub trait SlippageModel: std::fmt::Debug + Send + Sync {
    fn process_order(&self, bar: &Bar, order: &Order, bar_volume_consumed: f64) -> Option<Fill>;
}

impl SlippageModel for Box<dyn SlippageModel> {
    fn process_order(&self, bar: &Bar, order: &Order, bar_volume_consumed: f64) -> Option<Fill> {
        (**self).process_order(bar, order, bar_volume_consumed)
    }
}

fn fillable(bar: &Bar) -> bool {
    bar.close.is_finite() && bar.close > 0.0
}

// ================================================================================================
// Volume Share Slippage
// ================================================================================================

/// The reference equity model: fills are capped at a fraction of bar volume
/// and the price is impacted quadratically in the consumed volume share.
///
/// With the defaults, an order consuming the full 2.5% volume cap moves the
/// price by `0.025^2 * 0.1 = 0.00625%` against itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeShareSlippage {
    /// Maximum fraction of a bar's volume a single bar may fill.
    pub volume_limit: f64,
    /// Price impact coefficient applied to the squared volume share.
    pub price_impact: f64,
}

impl Default for VolumeShareSlippage {
    fn default() -> Self {
        Self {
            volume_limit: 0.025,
            price_impact: 0.1,
        }
    }
}

impl SlippageModel for VolumeShareSlippage {
    fn process_order(&self, bar: &Bar, order: &Order, bar_volume_consumed: f64) -> Option<Fill> {
        if !fillable(bar) || bar.volume <= 0.0 {
            return None;
        }

        let max_volume = self.volume_limit * bar.volume;
        let remaining_cap = max_volume - bar_volume_consumed;
        if remaining_cap < 1.0 {
            return None;
        }

        let wanted = order.remaining().abs() as f64;
        let cur_volume = remaining_cap.min(wanted).floor();
        if cur_volume < 1.0 {
            return None;
        }

        let volume_share = ((bar_volume_consumed + cur_volume) / bar.volume).min(self.volume_limit);
        let direction = if order.is_buy() { 1.0 } else { -1.0 };
        let impact = volume_share.powi(2) * self.price_impact * direction * bar.close;

        Some(Fill {
            price: bar.close + impact,
            amount: cur_volume as i64 * order.remaining().signum(),
        })
    }
}

// ================================================================================================
// Fixed Basis Points Slippage
// ================================================================================================

/// Fixed price concession in basis points, with a volume cap per bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBasisPointsSlippage {
    pub basis_points: f64,
    pub volume_limit: f64,
}

impl Default for FixedBasisPointsSlippage {
    fn default() -> Self {
        Self {
            basis_points: 5.0,
            volume_limit: 0.1,
        }
    }
}

impl SlippageModel for FixedBasisPointsSlippage {
    fn process_order(&self, bar: &Bar, order: &Order, bar_volume_consumed: f64) -> Option<Fill> {
        if !fillable(bar) || bar.volume <= 0.0 {
            return None;
        }

        let max_volume = (self.volume_limit * bar.volume).floor();
        let remaining_cap = max_volume - bar_volume_consumed;
        if remaining_cap < 1.0 {
            return None;
        }

        let cur_volume = remaining_cap.min(order.remaining().abs() as f64).floor();
        if cur_volume < 1.0 {
            return None;
        }

        let concession = bar.close * self.basis_points / 10_000.0;
        let price = if order.is_buy() {
            bar.close + concession
        } else {
            bar.close - concession
        };

        Some(Fill {
            price,
            amount: cur_volume as i64 * order.remaining().signum(),
        })
    }
}

// ================================================================================================
// No Slippage
// ================================================================================================

/// All orders fill immediately and completely at the current close price.
/// Primarily used for testing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoSlippage;

impl SlippageModel for NoSlippage {
    fn process_order(&self, bar: &Bar, order: &Order, _bar_volume_consumed: f64) -> Option<Fill> {
        if !fillable(bar) {
            return None;
        }
        Some(Fill {
            price: bar.close,
            amount: order.remaining(),
        })
    }
}
