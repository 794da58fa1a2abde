//! HTTP handlers.

pub mod events;
pub mod omegas;
pub mod ops;
pub mod sagas;

use common::GlobalTxId;

use crate::error::ApiError;

fn saga_id(raw: String) -> Result<GlobalTxId, ApiError> {
    Ok(GlobalTxId::parse(raw)?)
}
