// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The hot loops: pipelined submission with completion reaping, and the
//! single-operation variants used for ping-pong and latency runs.

use static_assertions::const_assert;

use crate::{ep::WorkQueue, run::CancelToken, sampler::Sampler, Error, Res};

/// Preferred submission chunk size. Submitting in fixed-size chunks lets
/// a binding reuse its cached submission state instead of rebuilding it
/// for every batch.
pub const BATCH_MIN: u32 = 10;
const_assert!(BATCH_MIN > 0);

/// Post up to `count` operations before the run starts, bounded by the
/// queue depth. Returns how many were posted; the caller accounts for
/// them as already pending.
pub fn prefill<Q: WorkQueue>(q: &mut Q, count: u64) -> Res<u32> {
    #[allow(clippy::cast_possible_truncation)]
    let n = count.min(u64::from(q.depth())) as u32;
    submit_chunks(q, n)?;
    Ok(n)
}

/// Perform `count` operations, keeping as many in flight as the queue
/// depth allows.
///
/// Each iteration tops the queue up with one batch and reaps the
/// completion queue once; when the queue is nearly full it only reaps.
/// At no point do more than `depth` operations remain unreaped.
pub fn run_pipelined<Q: WorkQueue>(
    q: &mut Q,
    count: u64,
    prefilled: u32,
    cancel: &CancelToken,
) -> Res<()> {
    let depth = q.depth();
    let threshold = BATCH_MIN.min(depth);
    let mut pending = prefilled;
    let mut remaining = count.saturating_sub(u64::from(prefilled));
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let free = depth - pending;
        if free < threshold {
            // Not enough room for a full chunk; reap before submitting.
            pending -= reap(q)?;
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let batch = remaining.min(u64::from(free)) as u32;
        submit_chunks(q, batch)?;
        pending += batch;
        remaining -= u64::from(batch);
        pending -= reap(q)?;
    }
    while pending > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        pending -= reap(q)?;
    }
    Ok(())
}

/// Perform `count` operations one at a time, optionally sampling each
/// submit-to-completion interval.
pub fn run_single<Q: WorkQueue>(
    q: &mut Q,
    count: u64,
    cancel: &CancelToken,
    mut sampler: Option<&mut Sampler>,
) -> Res<()> {
    for _ in 0..count {
        if let Some(s) = sampler.as_deref_mut() {
            s.start();
        }
        q.submit(1)?;
        poll_one(q, cancel)?;
        if let Some(s) = sampler.as_deref_mut() {
            s.stop();
        }
    }
    Ok(())
}

/// The measuring side of a ping-pong run: send, await the completion,
/// then await the echo. Each sample covers a full round trip.
pub fn ping<T: WorkQueue, R: WorkQueue>(
    tx: &mut T,
    rx: &mut R,
    count: u64,
    cancel: &CancelToken,
    sampler: &mut Sampler,
) -> Res<()> {
    for _ in 0..count {
        sampler.start();
        tx.submit(1)?;
        poll_one(tx, cancel)?;
        rx.submit(1)?;
        poll_one(rx, cancel)?;
        sampler.stop();
    }
    Ok(())
}

/// The echoing side of a ping-pong run.
pub fn pong<T: WorkQueue, R: WorkQueue>(
    tx: &mut T,
    rx: &mut R,
    count: u64,
    cancel: &CancelToken,
) -> Res<()> {
    for _ in 0..count {
        rx.submit(1)?;
        poll_one(rx, cancel)?;
        tx.submit(1)?;
        poll_one(tx, cancel)?;
    }
    Ok(())
}

fn submit_chunks<Q: WorkQueue>(q: &mut Q, batch: u32) -> Res<()> {
    let chunk_max = BATCH_MIN.min(q.depth());
    let mut left = batch;
    while left > 0 {
        let chunk = left.min(chunk_max);
        q.submit(chunk)?;
        left -= chunk;
    }
    Ok(())
}

fn reap<Q: WorkQueue>(q: &mut Q) -> Res<u32> {
    Ok(u32::try_from(q.poll()?).unwrap_or(u32::MAX))
}

fn poll_one<Q: WorkQueue>(q: &mut Q, cancel: &CancelToken) -> Res<()> {
    loop {
        if q.poll()? > 0 {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }
}
