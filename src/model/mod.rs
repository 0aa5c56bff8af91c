pub mod delivery;
pub mod kind;
pub mod order;
pub mod wish;

pub use delivery::{AuthChallenge, Delivery, ErrorCode, ResultCode};
pub use kind::LoaderKind;
pub use order::{GroupId, Order};
pub use wish::{AuthHint, Wish};
