//! Watermark-driven block pump.
//!
//! Blocks are pushed in bursts whenever the transport's send buffer drains to
//! the current low watermark. While many blocks remain the watermark stays
//! high so the callback fires less often; near the end it drops to zero.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::trace;

use crate::codec::{ChunkPlan, TransferHeader};
use crate::error::ChannelError;
use crate::progress::{ProgressSink, TransferProgress};

pub const BURST_LIMIT: usize = 32;
pub const ELEVATED_WATERMARK_BLOCKS: usize = 16;

/// The slice of a data channel the pump needs.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn send_header(&self, header: &TransferHeader) -> Result<(), ChannelError>;
    async fn send_block(&self, block: Bytes) -> Result<(), ChannelError>;
    async fn buffered_amount(&self) -> usize;
    async fn set_low_watermark(&self, threshold: usize);
    /// Resolves after the buffered amount has crossed down to the watermark.
    /// Spurious wakeups are allowed.
    async fn buffered_amount_low(&self);
}

pub fn watermark_for(remaining: usize, block_size: usize) -> usize {
    if remaining > ELEVATED_WATERMARK_BLOCKS {
        ELEVATED_WATERMARK_BLOCKS * block_size
    } else {
        0
    }
}

async fn drain_to<S: BlockSink + ?Sized>(sink: &S, watermark: usize) {
    while sink.buffered_amount().await > watermark {
        sink.buffered_amount_low().await;
    }
}

pub async fn pump_blocks<S: BlockSink + ?Sized>(
    sink: &S,
    plan: ChunkPlan,
    block_size: usize,
    progress: &dyn ProgressSink,
) -> Result<(), ChannelError> {
    let started = Instant::now();
    let ChunkPlan {
        header,
        blocks,
        total_bytes,
    } = plan;

    let mut watermark = 0;
    sink.set_low_watermark(watermark).await;
    sink.send_header(&header).await?;

    let mut remaining = blocks.len();
    let mut blocks = blocks.into_iter();
    let mut sent_bytes = 0;
    while remaining > 0 {
        drain_to(sink, watermark).await;
        watermark = watermark_for(remaining, block_size);
        sink.set_low_watermark(watermark).await;
        trace!(remaining, watermark, "pushing burst");
        for block in blocks.by_ref().take(BURST_LIMIT) {
            sent_bytes += block.len();
            sink.send_block(block).await?;
            remaining -= 1;
            progress.on_progress(TransferProgress {
                bytes_transferred: sent_bytes,
                total_bytes,
                elapsed: started.elapsed(),
            });
        }
    }
    Ok(())
}

/// Runs [`pump_blocks`] until it finishes or `disposed` flips to true.
pub async fn pump_until_disposed<S: BlockSink + ?Sized>(
    sink: &S,
    plan: ChunkPlan,
    block_size: usize,
    progress: &dyn ProgressSink,
    disposed: &mut watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    if *disposed.borrow_and_update() {
        return Err(ChannelError::Disposed);
    }
    tokio::select! {
        result = pump_blocks(sink, plan, block_size, progress) => result,
        _ = wait_disposed(disposed) => Err(ChannelError::Disposed),
    }
}

pub(crate) async fn wait_disposed(disposed: &mut watch::Receiver<bool>) {
    while !*disposed.borrow_and_update() {
        if disposed.changed().await.is_err() {
            return;
        }
    }
}
