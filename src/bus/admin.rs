use anyhow::Context;
use tracing::info;

use super::Bus;
use crate::message::{Endpoint, EndpointError};
use crate::store::LinkRecord;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Rejected before the graph was touched.
    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointError),
    /// The in-memory graph already reflects the change; only storage failed.
    #[error("link change applied but not persisted: {source}")]
    Persistence {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BridgeError {
    fn persistence(err: anyhow::Error) -> Self {
        BridgeError::Persistence { source: err.into() }
    }
}

impl Bus {
    /// Link `from` to `to` (and back, if `bidirectional`), then persist.
    ///
    /// The graph is updated first, so routing reflects the new link even if
    /// the storage write fails; in that case the edge stays in memory and
    /// the error is returned for the caller to retry or report.
    pub async fn add_bridge_link(
        &self,
        from: &Endpoint,
        to: &Endpoint,
        cause: Option<&str>,
        bidirectional: bool,
    ) -> Result<(), BridgeError> {
        from.validate()?;
        to.validate()?;
        info!(
            "Bridging {} and {} (bidirectional: {})",
            from, to, bidirectional
        );

        let graph = &self.inner.graph;
        graph.add_link(from, to);
        if bidirectional {
            graph.add_link(to, from);
        }

        let cause = cause.map(str::to_string);
        let store = &self.inner.store;
        store
            .upsert_link(&LinkRecord::new(from.clone(), to.clone(), cause.clone()))
            .await
            .map_err(BridgeError::persistence)?;
        if bidirectional {
            store
                .upsert_link(&LinkRecord::new(to.clone(), from.clone(), cause))
                .await
                .map_err(BridgeError::persistence)?;
        }
        Ok(())
    }

    /// Remove the link from `from` to `to` (and back, if `bidirectional`),
    /// then delete it from storage. Missing links are not an error.
    pub async fn remove_bridge_link(
        &self,
        from: &Endpoint,
        to: &Endpoint,
        bidirectional: bool,
    ) -> Result<(), BridgeError> {
        from.validate()?;
        to.validate()?;
        info!(
            "Unbridging {} and {} (bidirectional: {})",
            from, to, bidirectional
        );

        let graph = &self.inner.graph;
        graph.remove_link(from, to);
        if bidirectional {
            graph.remove_link(to, from);
        }
        self.prune_idle_lanes();

        let store = &self.inner.store;
        store
            .delete_link(from, to)
            .await
            .map_err(BridgeError::persistence)?;
        if bidirectional {
            store
                .delete_link(to, from)
                .await
                .map_err(BridgeError::persistence)?;
        }
        Ok(())
    }

    /// Rebuild the graph from every persisted link. Returns the number of
    /// stored rows.
    pub async fn load_links(&self) -> anyhow::Result<usize> {
        let rows = self
            .inner
            .store
            .list_links()
            .await
            .context("Failed to load persisted links")?;
        let count = rows.len();
        self.inner
            .graph
            .extend(rows.into_iter().map(|row| (row.from, row.to)));
        info!("Loaded {} links", count);
        Ok(count)
    }
}
