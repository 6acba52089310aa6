//! CUDA implementation of TransferSyncOps
//!
//! Joins the copy and reconstruction streams into the primary compute
//! stream so the attention kernel observes both transfer stages.

use crate::error::Result;
use crate::ops::cuda::stream::join_transfer_streams;
use crate::ops::traits::TransferSyncOps;
use numr::runtime::cuda::{CudaClient, CudaRuntime};

impl TransferSyncOps<CudaRuntime> for CudaClient {
    fn sync_transfer_streams(&self) -> Result<()> {
        join_transfer_streams(self)
    }
}
