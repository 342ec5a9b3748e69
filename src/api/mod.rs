pub mod exchange;
pub mod okx;
pub mod signing;

pub use exchange::Exchange;
pub use okx::{ApiResponse, OkxClient, RestContext, RetryPolicy};
pub use signing::{Credentials, RequestSigner, ServerClock};
