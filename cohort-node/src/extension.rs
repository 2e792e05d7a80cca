use async_trait::async_trait;

use crate::CohortNode;

#[async_trait]
/// An extension of the base node.
///
/// This can be used to extend a base node to include additional
/// functionality, like the replication commit path, which wants to
/// follow the agreed membership and the current role holders.
pub trait ClusterExtension {
    type Output;
    type Error;

    async fn init_extension(
        self,
        node: &CohortNode,
    ) -> Result<Self::Output, Self::Error>;
}
