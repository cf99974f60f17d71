//! Concurrent dispatch of batches to ready destinations
//!
//! Every (batch, destination) pair becomes one tracked operation in a
//! [`JoinSet`]. Operations of one batch run concurrently with each other and
//! with those of earlier batches. [`Dispatcher::join`] waits for all of them,
//! even after failures, and reports every failure it observed.

use crate::error::{IngestError, IngestResult};
use crate::lifecycle::ReadyDestination;
use crate::stream::Chunker;
use crate::transform::{Batch, RawRecord};
use futures::Stream;
use ndload_common::DestinationId;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

/// Scheduling knobs for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Bound on concurrently running operations; unbounded when `None`
    pub max_in_flight: Option<NonZeroUsize>,

    /// Write batches to each destination one at a time, in arrival order
    pub ordered: bool,
}

/// Totals of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub records: usize,
    /// Tracked operations issued, one per (batch, destination)
    pub operations: usize,
    pub rows_written: BTreeMap<DestinationId, usize>,
}

impl RunSummary {
    pub fn total_rows(&self) -> usize {
        self.rows_written.values().sum()
    }
}

struct OperationOutcome {
    destination: DestinationId,
    batch: usize,
    result: IngestResult<usize>,
}

/// Fans batches out to destinations and tracks the resulting operations
pub struct Dispatcher {
    destinations: Vec<ReadyDestination>,
    options: DispatchOptions,
    tasks: JoinSet<OperationOutcome>,
    permits: Option<Arc<Semaphore>>,
    /// Completion signal of the last operation issued per destination (ordered mode)
    tails: HashMap<DestinationId, oneshot::Receiver<()>>,
    summary: RunSummary,
    failures: Vec<IngestError>,
}

impl Dispatcher {
    pub fn new(destinations: Vec<ReadyDestination>, options: DispatchOptions) -> Self {
        let summary = RunSummary {
            rows_written: destinations
                .iter()
                .map(|d| (d.config.id.clone(), 0))
                .collect(),
            ..RunSummary::default()
        };

        Self {
            destinations,
            options,
            tasks: JoinSet::new(),
            permits: options
                .max_in_flight
                .map(|limit| Arc::new(Semaphore::new(limit.get()))),
            tails: HashMap::new(),
            summary,
            failures: Vec::new(),
        }
    }

    pub fn destinations(&self) -> &[ReadyDestination] {
        &self.destinations
    }

    /// Operations issued and not yet observed
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Issue one operation per destination for `batch`.
    ///
    /// With a bound configured this waits for a free slot before each
    /// operation, which in turn holds back the producer. Returns the number of
    /// operations issued.
    pub async fn dispatch(&mut self, batch: Batch) -> usize {
        let index = self.summary.batches;
        self.summary.batches += 1;
        self.summary.records += batch.len();

        let batch = Arc::new(batch);
        let mut issued = 0;

        for destination in &self.destinations {
            let permit = match self.permits {
                Some(ref semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                None => None,
            };

            let id = destination.config.id.clone();
            let (previous, done) = if self.options.ordered {
                let (tx, rx) = oneshot::channel();
                (self.tails.insert(id.clone(), rx), Some(tx))
            } else {
                (None, None)
            };

            let config = Arc::clone(&destination.config);
            let adapter = Arc::clone(&destination.adapter);
            let batch = Arc::clone(&batch);

            self.tasks.spawn(async move {
                let _permit = permit;

                if let Some(previous) = previous {
                    // An error only means the predecessor is gone; either way it finished.
                    let _ = previous.await;
                }

                let result = adapter.ingest_records(&batch, &config).await;

                if let Some(done) = done {
                    let _ = done.send(());
                }

                OperationOutcome {
                    destination: id,
                    batch: index,
                    result,
                }
            });
            issued += 1;
        }

        self.summary.operations += issued;
        debug!(batch = index, records = batch.len(), operations = issued, "Batch dispatched");

        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }

        issued
    }

    fn record(&mut self, joined: Result<OperationOutcome, JoinError>) {
        match joined {
            Ok(OperationOutcome {
                destination,
                batch,
                result: Ok(rows),
            }) => {
                debug!(destination = %destination, batch, rows, "Batch ingested");
                *self.summary.rows_written.entry(destination).or_default() += rows;
            },
            Ok(OperationOutcome {
                destination,
                batch,
                result: Err(e),
            }) => {
                error!(destination = %destination, batch, error = %e, "Batch ingestion failed");
                self.failures.push(IngestError::Operation {
                    destination,
                    batch,
                    source: Box::new(e),
                });
            },
            Err(e) => {
                error!(error = %e, "Ingestion task did not complete");
                self.failures.push(IngestError::Join(e.to_string()));
            },
        }
    }

    /// Wait for every tracked operation and aggregate the failures
    pub async fn join(mut self) -> IngestResult<RunSummary> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }

        if self.failures.is_empty() {
            Ok(self.summary)
        } else {
            Err(IngestError::Aggregate(self.failures))
        }
    }
}

/// Ingest a record stream into ready destinations.
///
/// Batches are pulled lazily and dispatched as they arrive. The run finishes
/// only after every tracked operation is joined. An input failure stops the
/// pulling but not the operations already issued; it is reported together
/// with any operation failures.
pub async fn ingest_stream<S>(
    source: S,
    batch_size: NonZeroUsize,
    destinations: Vec<ReadyDestination>,
    options: DispatchOptions,
) -> IngestResult<RunSummary>
where
    S: Stream<Item = IngestResult<RawRecord>> + Send,
{
    info!(
        destinations = destinations.len(),
        batch_size = batch_size.get(),
        max_in_flight = ?options.max_in_flight,
        ordered = options.ordered,
        "Starting ingestion"
    );

    let mut chunker = Chunker::new(Box::pin(source), batch_size);
    let mut dispatcher = Dispatcher::new(destinations, options);

    let input_error = loop {
        match chunker.next_batch().await {
            Ok(Some(batch)) => {
                dispatcher.dispatch(batch).await;
            },
            Ok(None) => break None,
            Err(e) => {
                error!(error = %e, "Input failed, waiting for issued operations");
                break Some(e);
            },
        }
    };

    let joined = dispatcher.join().await;

    match (input_error, joined) {
        (None, Ok(summary)) => {
            info!(
                batches = summary.batches,
                records = summary.records,
                operations = summary.operations,
                rows = summary.total_rows(),
                "Ingestion complete"
            );
            Ok(summary)
        },
        (None, Err(e)) => Err(e),
        (Some(input), Ok(_)) => Err(input),
        (Some(input), Err(IngestError::Aggregate(failures))) => {
            let mut errors = Vec::with_capacity(failures.len() + 1);
            errors.push(input);
            errors.extend(failures);
            Err(IngestError::Aggregate(errors))
        },
        (Some(input), Err(other)) => Err(IngestError::Aggregate(vec![input, other])),
    }
}
