//! Timer operations

use std::time::Duration;
use tether_core::{AsyncOperation, OperationValue};
use tokio::runtime::Handle;

/// A void operation that completes after `duration`.
pub fn delay(handle: &Handle, duration: Duration) -> AsyncOperation {
    let (operation, completer) = AsyncOperation::pending();
    handle.spawn(async move {
        tokio::time::sleep(duration).await;
        completer.succeed(OperationValue::Void);
    });
    operation
}
