use async_trait::async_trait;

use super::RawFileSystem;

/// A filesystem that supports nothing.
///
/// Every request operation answers "not implemented". Useful as a mount
/// placeholder and as the baseline a backend grows from.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFileSystem;

#[async_trait]
impl RawFileSystem for DefaultFileSystem {
    type Node = u64;
    type Session = ();

    fn root(&self) -> u64 {
        1
    }
}
