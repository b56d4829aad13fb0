use async_trait::async_trait;

use crate::{JobId, Result};

/// Hook handed every job's serialized `data` on update, keyed by id.
/// The indexer's contract is opaque to the core.
#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    async fn index(&self, id: JobId, body: &str) -> Result<()>;
    async fn deindex(&self, id: JobId) -> Result<()>;
}

/// Default indexer: does nothing.
pub struct NoopIndex;

#[async_trait]
impl SearchIndex for NoopIndex {
    async fn index(&self, _id: JobId, _body: &str) -> Result<()> {
        Ok(())
    }

    async fn deindex(&self, _id: JobId) -> Result<()> {
        Ok(())
    }
}
