//! Transfer stream synchronisation trait

use crate::error::Result;
use numr::runtime::Runtime;

/// Happens-before edge from the secondary transfer streams to the primary
/// compute stream.
///
/// The value gather and key reconstruction of a decode step run on two
/// dedicated streams. The attention kernel consuming the scratch buffers must
/// observe both; callers invoke `sync_transfer_streams` after the fetch pair
/// and before attention. Implementations must establish the edge explicitly
/// (event wait or stream join), never rely on implicit ordering.
///
/// On backends without asynchronous transfers (CPU) this is a no-op.
pub trait TransferSyncOps<R: Runtime> {
    fn sync_transfer_streams(&self) -> Result<()>;
}
