use serde::{Deserialize, Serialize};

pub fn utc_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// The order side that increases a position on this side.
    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// The order side that reduces a position on this side.
    pub fn close_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

pub const BOTH_SIDES: [PositionSide; 2] = [PositionSide::Long, PositionSide::Short];

/// Per-side operating mode.
///
/// - `Normal`: full grid, entries and closes.
/// - `GracefulStop`: no new position when flat; an existing position keeps
///   its reentries and closes until it is gone.
/// - `TpOnly`: only reduce-only orders are maintained.
/// - `Panic`: a single close at the touch price, nothing else.
/// - `Manual`: the bot does not touch this side's orders at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    GracefulStop,
    TpOnly,
    Panic,
    Manual,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::GracefulStop => "graceful_stop",
            Mode::TpOnly => "tp_only",
            Mode::Panic => "panic",
            Mode::Manual => "manual",
        }
    }
}

/// Per-symbol contract metadata. Immutable within a session, refreshed hourly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub price_step: f64,
    pub qty_step: f64,
    pub min_qty: f64,
    pub min_cost: f64,
    pub c_mult: f64,
    pub inverse: bool,
    pub active: bool,
    pub quote: String,
    /// Timestamp (ms) of the first candle on the venue, if known.
    pub listed_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub ts: i64,
}

impl Ticker {
    /// The smallest order notional the venue will actually accept at the
    /// current price: min_cost, or min_qty worth of contracts if that is more.
    pub fn effective_min_cost(&self, market: &Market) -> f64 {
        market
            .min_cost
            .max(market.min_qty * self.last * market.c_mult)
    }
}

/// Position on one side of one symbol. Size is signed: long > 0, short < 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub size: f64,
    pub price: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size != 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub qty: f64,
    pub price: f64,
    pub reduce_only: bool,
    /// Exchange-assigned id; None until acked.
    pub id: Option<String>,
    /// Client id: order-kind tag plus a uuid suffix.
    pub custom_id: String,
}

impl Order {
    /// reduce_only must hold exactly for closes: long+sell or short+buy.
    pub fn reduce_only_consistent(&self) -> bool {
        self.reduce_only
            == matches!(
                (self.position_side, self.side),
                (PositionSide::Long, Side::Sell) | (PositionSide::Short, Side::Buy)
            )
    }
}

/// What produced an order proposal. Also used as the custom-id prefix, so the
/// venue-side order history stays greppable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    EntryInitialNormal,
    EntryGridNormal,
    EntryGridCropped,
    EntryTrailingNormal,
    EntryTrailingCropped,
    CloseGrid,
    CloseTrailing,
    CloseUnstuck,
    ClosePanic,
}

impl OrderKind {
    pub fn is_close(self) -> bool {
        matches!(
            self,
            OrderKind::CloseGrid
                | OrderKind::CloseTrailing
                | OrderKind::CloseUnstuck
                | OrderKind::ClosePanic
        )
    }

    pub fn is_initial(self) -> bool {
        matches!(self, OrderKind::EntryInitialNormal)
    }

    pub fn is_unstuck(self) -> bool {
        matches!(self, OrderKind::CloseUnstuck)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::EntryInitialNormal => "entry_initial_normal",
            OrderKind::EntryGridNormal => "entry_grid_normal",
            OrderKind::EntryGridCropped => "entry_grid_cropped",
            OrderKind::EntryTrailingNormal => "entry_trailing_normal",
            OrderKind::EntryTrailingCropped => "entry_trailing_cropped",
            OrderKind::CloseGrid => "close_grid",
            OrderKind::CloseTrailing => "close_trailing",
            OrderKind::CloseUnstuck => "close_unstuck",
            OrderKind::ClosePanic => "close_panic",
        }
    }
}

/// One position row as returned by a positions fetch.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Signed: long > 0, short < 0.
    pub size: f64,
    pub price: f64,
}

/// One realized-pnl fill as reported by the venue. Deduped by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlFill {
    pub id: String,
    pub symbol: String,
    pub position_side: PositionSide,
    pub qty: f64,
    pub price: f64,
    pub pnl: f64,
    pub timestamp: i64,
}

/// One candle as fetched from the venue, any timeframe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// High/low/close of one minute, keyed by minute-start ms in the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hlc {
    pub ts: i64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Running price extremes since the last position change, per symbol x side.
/// Drives trailing entries and closes. Reset to sentinels whenever the
/// position crosses zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingExtremes {
    pub max_since_open: f64,
    pub min_since_max: f64,
    pub min_since_open: f64,
    pub max_since_min: f64,
}

impl Default for TrailingExtremes {
    fn default() -> Self {
        Self {
            max_since_open: 0.0,
            min_since_max: f64::INFINITY,
            min_since_open: f64::INFINITY,
            max_since_min: 0.0,
        }
    }
}

/// Order lifecycle events pushed by the venue's order stream.
#[derive(Debug, Clone)]
pub enum OrderUpdate {
    New(Order),
    Cancelled(Order),
    Filled(Order),
}

/// One reconciliation round, engine -> exec task. Cancels are dispatched and
/// awaited before any create goes out.
#[derive(Debug, Clone)]
pub enum ExecCommand {
    Batch {
        cancels: Vec<Order>,
        creates: Vec<Order>,
    },
}
