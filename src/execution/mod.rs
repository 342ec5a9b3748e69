// Trading loops, lifecycle state and market data
pub mod account;
pub mod executor;
pub mod lifecycle;
pub mod position_manager;
pub mod price_feed;
pub mod scheduler;
pub mod shutdown;

pub use account::{AccountUpdater, ProfitLedger};
pub use executor::{ExecutionAction, ExecutionDecision, Executor};
pub use lifecycle::{ExitKind, Lifecycle, PendingEntry, Phase};
pub use position_manager::{PendingVerdict, PositionManager};
pub use price_feed::{
    FeedKind, FeedState, PriceCache, PriceFeed, SessionEvent, StreamListener, StreamUpdate,
};
pub use scheduler::Scheduler;
pub use shutdown::ShutdownSignal;
