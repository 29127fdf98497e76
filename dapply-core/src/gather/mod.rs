//! Collection of round results.
//!
//! The inverse of [`scatter`](crate::scatter): workers run [`submit`], the
//! coordinator runs [`collect`], and the two sides perform three gathers:
//!
//! 1. the total byte length of each worker's results;
//! 2. the byte size of every individual result, split by the round's task
//!    counts;
//! 3. the concatenated result bytes, split by the totals from step 1.
//!
//! Results are then cut out of the flat buffer by their sizes. Because each
//! process owns a contiguous run of task indices, in rank order, laying the
//! coordinator's own results first and every worker's after them places
//! each result at its task's index.
//!
//! The coordinator's own results are never gathered: its contribution to
//! every gather, and its entry in every gather layout, is zero.
use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    group::{ProcessGroup, COORDINATOR},
    packing::{decode_sizes, encode_sizes, pack, segment_sums, unpack, Layout, ShapeError, SIZE_WIDTH},
    partition::Partition,
    transport::Transport,
};

/// Zero out the coordinator's entry of a per-rank count array.
fn without_coordinator(mut counts: Vec<usize>) -> Layout {
    if let Some(count) = counts.get_mut(COORDINATOR) {
        *count = 0;
    }
    Layout::from_counts(counts)
}

/// Assemble the result batch on the coordinator.
///
/// `own_results` are the coordinator's results for its own task range.
#[instrument(skip_all, fields(group = %group, tasks = partition.task_count()), level = "debug")]
pub async fn collect<T: Transport + ?Sized>(
    transport: &mut T,
    group: ProcessGroup,
    partition: &Partition,
    own_results: Vec<Bytes>,
) -> Result<Vec<Bytes>> {
    let own_count = partition.task_layout().count(COORDINATOR)?;
    if own_results.len() != own_count {
        return Err(ShapeError::CountMismatch {
            expected: own_count,
            actual: own_results.len(),
        }
        .into());
    }
    if partition.task_count() == 0 {
        return Ok(own_results);
    }

    let totals_layout = without_coordinator(vec![SIZE_WIDTH; group.size()]);
    let totals = transport
        .gather_varied(Bytes::new(), Some(&totals_layout), COORDINATOR)
        .await
        .context("gathering result lengths")?
        .unwrap_or_default();
    let mut totals = decode_sizes(totals)?;
    totals.insert(COORDINATOR, 0);

    let worker_counts = without_coordinator(partition.counts().to_vec());
    let sizes = transport
        .gather_varied(
            Bytes::new(),
            Some(&worker_counts.scaled(SIZE_WIDTH)),
            COORDINATOR,
        )
        .await
        .context("gathering result sizes")?
        .unwrap_or_default();
    let sizes = decode_sizes(sizes)?;

    // Each worker's reported total must match the sizes it reported.
    let sums = segment_sums(&sizes, worker_counts.counts())?;
    if let Some((expected, actual)) = sums
        .iter()
        .zip(&totals)
        .find(|(sum, total)| sum != total)
    {
        return Err(ShapeError::LengthMismatch {
            expected: *expected,
            actual: *actual,
        }
        .into());
    }

    let flat = transport
        .gather_varied(Bytes::new(), Some(&Layout::from_counts(totals)), COORDINATOR)
        .await
        .context("gathering result payloads")?
        .unwrap_or_default();
    debug!(bytes = flat.len(), "gathered results");

    let mut results = own_results;
    results.reserve(sizes.len());
    results.extend(unpack(flat, &sizes)?);
    Ok(results)
}

/// Send this process's results to the coordinator. Worker side.
///
/// `task_count` is the size of the whole batch; when it is zero no gather
/// takes place.
#[instrument(skip_all, fields(group = %group, results = results.len()), level = "debug")]
pub async fn submit<T: Transport + ?Sized>(
    transport: &mut T,
    group: ProcessGroup,
    task_count: usize,
    results: Vec<Bytes>,
) -> Result<()> {
    if task_count == 0 {
        return Ok(());
    }

    let (flat, sizes) = pack(&results);
    drop(results);

    transport
        .gather_varied(encode_sizes(&[flat.len()]), None, COORDINATOR)
        .await
        .context("submitting result length")?;
    transport
        .gather_varied(encode_sizes(&sizes), None, COORDINATOR)
        .await
        .context("submitting result sizes")?;
    transport
        .gather_varied(flat, None, COORDINATOR)
        .await
        .context("submitting result payloads")?;

    Ok(())
}
