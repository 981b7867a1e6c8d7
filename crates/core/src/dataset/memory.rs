use veil_common::models::Metadata;

use crate::frame::TabularView;

use super::Connector;

/// Dataset held directly in memory.
///
/// Used for dummy-query frames and for the demo dataset seeded in develop
/// mode.
#[derive(Debug)]
pub struct InMemoryConnector {
    metadata: Metadata,
    view: TabularView,
}

impl InMemoryConnector {
    pub fn new(metadata: Metadata, view: TabularView) -> Self {
        Self { metadata, view }
    }
}

impl Connector for InMemoryConnector {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn as_tabular(&self) -> TabularView {
        self.view.clone()
    }
}
