//! The multi-worker builder: same external contract as the single-worker
//! variant, with compression fanned out to N parallel tasks while the
//! on-disk block order stays identical to the input order.
//!
//! Each worker owns an input buffer that circulates between the producer and
//! the worker over a pair of bounded channels (the fill/compress handshake),
//! and the right to append to the backing file circulates as a turn token
//! through a semaphore ring: worker 0 starts with the token, every worker
//! passes it to its successor after appending. The producer dispatches
//! blocks round-robin in worker order, so appends happen in input order no
//! matter how long any individual compression takes.

use std::{io, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::{
    sync::{mpsc, Mutex, Semaphore},
    task::JoinHandle,
};

use crate::base::{ByteSize, ZfileError, ZfileResult};
use crate::codec::create_codec;
use crate::container::builder::{compress_block, write_tail, CompressArgs};
use crate::container::format::{
    write_record, CompressOptions, HeaderTrailer, COMPRESS_HEADROOM, HT_SPACE,
};
use crate::fio::BackingFile;

/// Append cursor and block-length vector. Only the worker currently holding
/// the turn token touches this, so the lock is never contended.
#[derive(Debug)]
struct EmitState {
    moffset: u64,
    block_len: Vec<u32>,
}

struct WorkerLane {
    /// Filled input buffers travel to the worker here; closing this channel
    /// is the stop signal.
    job_tx: mpsc::Sender<BytesMut>,
    /// Drained input buffers travel back for refilling.
    buf_rx: mpsc::Receiver<BytesMut>,
    task: JoinHandle<ZfileResult<()>>,
}

fn worker_gone() -> ZfileError {
    ZfileError::Io(io::Error::other("compression worker terminated early"))
}

/// Multi-worker streaming builder.
pub struct ZfileBuilderMp<F: BackingFile> {
    file: Arc<F>,
    opt: CompressOptions,
    overwrite_header: bool,
    ht: HeaderTrailer,
    raw_size: u64,
    lanes: Vec<WorkerLane>,
    /// Worker that receives the next block.
    cur: usize,
    /// Partially filled input buffer for `lanes[cur]`; always shorter than
    /// one block.
    filling: Option<BytesMut>,
    emit: Arc<Mutex<EmitState>>,
}

impl<F: BackingFile + std::fmt::Debug> std::fmt::Debug for ZfileBuilderMp<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZfileBuilderMp")
            .field("file", &self.file)
            .field("opt", &self.opt)
            .field("overwrite_header", &self.overwrite_header)
            .field("ht", &self.ht)
            .field("raw_size", &self.raw_size)
            .field("num_lanes", &self.lanes.len())
            .field("cur", &self.cur)
            .field("filling", &self.filling)
            .finish()
    }
}

impl<F: BackingFile + 'static> ZfileBuilderMp<F> {
    pub async fn create(file: F, args: &CompressArgs) -> ZfileResult<Self> {
        args.opt.validate()?;
        if args.workers < 2 {
            return Err(ZfileError::Config(
                "multi-worker builder needs at least two workers",
            ));
        }
        info!(
            block_size = ?ByteSize(args.opt.block_size as u64),
            algo = %args.opt.algo,
            verify = args.opt.verify,
            workers = args.workers,
            "creating multi-worker compressing builder"
        );

        let mut ht = HeaderTrailer::new(&args.opt);
        write_record(&file, &mut ht, true, false, false, 0).await?;

        let file = Arc::new(file);
        let emit = Arc::new(Mutex::new(EmitState {
            moffset: (HT_SPACE as u64) + args.opt.dict_size as u64,
            block_len: Vec::new(),
        }));
        // worker 0 starts with the append turn token
        let turn: Arc<Vec<Semaphore>> = Arc::new(
            (0..args.workers)
                .map(|id| Semaphore::new(usize::from(id == 0)))
                .collect(),
        );

        let block_size = args.opt.block_size as usize;
        let mut lanes = Vec::with_capacity(args.workers);
        for id in 0..args.workers {
            let (job_tx, job_rx) = mpsc::channel::<BytesMut>(1);
            let (buf_tx, buf_rx) = mpsc::channel::<BytesMut>(1);
            buf_tx
                .try_send(BytesMut::with_capacity(block_size))
                .expect("fresh recycle channel has capacity");
            let task = tokio::spawn(worker_loop(
                id,
                args.workers,
                file.clone(),
                args.opt,
                job_rx,
                buf_tx,
                turn.clone(),
                emit.clone(),
            ));
            lanes.push(WorkerLane {
                job_tx,
                buf_rx,
                task,
            });
        }

        Ok(Self {
            file,
            opt: args.opt,
            overwrite_header: args.overwrite_header,
            ht,
            raw_size: 0,
            lanes,
            cur: 0,
            filling: None,
            emit,
        })
    }

    /// Accepts `buf` in its entirety, copying it into per-worker input
    /// buffers and dispatching each completed block to the next worker in
    /// ring order. Returns `buf.len()`.
    pub async fn write(&mut self, mut buf: &[u8]) -> ZfileResult<usize> {
        let accepted = buf.len();
        self.raw_size += accepted as u64;
        let block_size = self.opt.block_size as usize;

        while !buf.is_empty() {
            if self.filling.is_none() {
                let recycled = self.lanes[self.cur]
                    .buf_rx
                    .recv()
                    .await
                    .ok_or_else(worker_gone)?;
                self.filling = Some(recycled);
            }
            let ibuf = self.filling.as_mut().expect("input buffer present");
            let take = (block_size - ibuf.len()).min(buf.len());
            ibuf.extend_from_slice(&buf[..take]);
            buf = &buf[take..];

            if ibuf.len() == block_size {
                let full = self.filling.take().expect("input buffer present");
                self.lanes[self.cur]
                    .job_tx
                    .send(full)
                    .await
                    .map_err(|_| worker_gone())?;
                self.cur = (self.cur + 1) % self.lanes.len();
            }
        }
        Ok(accepted)
    }

    /// Dispatches the reserved tail as a short final block, stops and joins
    /// every worker, writes the index and sealed trailer, syncs, and returns
    /// the backing file.
    pub async fn finalize(mut self) -> ZfileResult<F> {
        if let Some(tail) = self.filling.take() {
            if !tail.is_empty() {
                debug!(len = tail.len(), "dispatching reserved tail block");
                self.lanes[self.cur]
                    .job_tx
                    .send(tail)
                    .await
                    .map_err(|_| worker_gone())?;
            }
        }

        // dropping every job channel is the stop signal; workers drain any
        // queued block first, so a final short block is never lost
        let mut tasks = Vec::with_capacity(self.lanes.len());
        for lane in self.lanes.drain(..) {
            tasks.push(lane.task);
        }
        let mut first_err = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(join) => {
                    first_err = first_err.or(Some(ZfileError::Io(io::Error::other(join))))
                }
            }
        }
        if let Some(e) = first_err {
            error!("a compression worker failed: {e}");
            return Err(e);
        }

        let (moffset, block_len) = {
            let mut emit = self.emit.lock().await;
            (emit.moffset, std::mem::take(&mut emit.block_len))
        };
        write_tail(
            self.file.as_ref(),
            &mut self.ht,
            &block_len,
            moffset,
            self.raw_size,
            self.overwrite_header,
        )
        .await?;
        self.file.sync_all().await?;

        Arc::into_inner(self.file)
            .ok_or_else(|| ZfileError::Io(io::Error::other("backing file handle still shared")))
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<F: BackingFile>(
    id: usize,
    workers: usize,
    file: Arc<F>,
    opt: CompressOptions,
    mut job_rx: mpsc::Receiver<BytesMut>,
    buf_tx: mpsc::Sender<BytesMut>,
    turn: Arc<Vec<Semaphore>>,
    emit: Arc<Mutex<EmitState>>,
) -> ZfileResult<()> {
    let mut codec = create_codec(&opt)?;
    let mut obuf = BytesMut::with_capacity(opt.block_size as usize + COMPRESS_HEADROOM);
    let mut first_err: Option<ZfileError> = None;

    while let Some(mut ibuf) = job_rx.recv().await {
        // compress while the previous writer still holds the turn token
        let mut staged = None;
        if first_err.is_none() {
            match compress_block(codec.as_mut(), &opt, &ibuf, &mut obuf) {
                Ok(total) => staged = Some(total),
                Err(e) => first_err = Some(e),
            }
        }
        // the input buffer is free again; the producer may be gone already
        // during finalization, which is fine
        ibuf.clear();
        let _ = buf_tx.send(ibuf).await;

        // take the append turn; pass it on no matter what happened, so the
        // ring keeps moving and every sibling can drain and exit
        match turn[id].acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => {
                first_err.get_or_insert_with(|| {
                    ZfileError::Io(io::Error::other("append turn ring closed"))
                });
                continue;
            }
        }
        if let Some(total) = staged {
            let mut emit = emit.lock().await;
            let pos = emit.moffset;
            let (res, _) = file
                .write_all_at(Bytes::copy_from_slice(&obuf[..total]), pos)
                .await;
            match res {
                Ok(()) => {
                    emit.moffset += total as u64;
                    emit.block_len.push(total as u32);
                    trace!(worker = id, pos, len = total, "appended compressed block");
                }
                Err(e) => first_err = Some(e.into()),
            }
        }
        turn[(id + 1) % workers].add_permits(1);
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
