use crate::model::error::StoreError;
use crate::model::{DelayState, Raise};

/// Shared delay debt, read by every request and raised by critical ones.
///
/// `raise` must be atomic with respect to other raises: the decayed comparison
/// and the write happen as one step, so the larger of two concurrent claims wins.
pub trait DelayStore: Send + Sync + 'static {
    fn read(&self) -> impl Future<Output = Result<DelayState, StoreError>> + Send;

    fn raise(
        &self,
        candidate: DelayState,
    ) -> impl Future<Output = Result<Raise, StoreError>> + Send;
}
