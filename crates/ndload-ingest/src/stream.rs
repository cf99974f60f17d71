//! Line-delimited JSON decoding and batching

use crate::error::{IngestError, IngestResult};
use crate::transform::{Batch, RawRecord};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::num::NonZeroUsize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::wrappers::LinesStream;

/// Decode one JSON object per line.
///
/// Blank lines are skipped. A line that is not valid JSON, or is valid JSON
/// but not an object, yields a [`IngestError::Decode`] with its 1-based line
/// number.
pub fn ndjson_records<R>(reader: R) -> impl Stream<Item = IngestResult<RawRecord>> + Send
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    LinesStream::new(reader.lines())
        .enumerate()
        .filter_map(|(index, line)| async move {
            match line {
                Err(e) => Some(Err(IngestError::Input(e))),
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(decode_line(index + 1, &line)),
            }
        })
}

fn decode_line(line_number: usize, line: &str) -> IngestResult<RawRecord> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(IngestError::Decode {
            line: line_number,
            message: format!("expected a JSON object, found {}", json_kind(&other)),
        }),
        Err(e) => Err(IngestError::Decode {
            line: line_number,
            message: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Lazily groups a record stream into batches of a fixed size.
///
/// Single pass: once the source is exhausted or has failed, every further call
/// returns `Ok(None)`. The last batch may be short but is never empty.
pub struct Chunker<S> {
    source: S,
    batch_size: NonZeroUsize,
    finished: bool,
}

impl<S> Chunker<S>
where
    S: Stream<Item = IngestResult<RawRecord>> + Unpin,
{
    pub fn new(source: S, batch_size: NonZeroUsize) -> Self {
        Self {
            source,
            batch_size,
            finished: false,
        }
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Pull up to `batch_size` records from the source
    pub async fn next_batch(&mut self) -> IngestResult<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }

        let size = self.batch_size.get();
        let mut batch = Vec::with_capacity(size.min(4096));

        while batch.len() < size {
            match self.source.next().await {
                Some(Ok(record)) => batch.push(record),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                },
                None => {
                    self.finished = true;
                    break;
                },
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::Cursor;

    fn reader(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    async fn collect(text: &str) -> Vec<IngestResult<RawRecord>> {
        ndjson_records(reader(text)).collect().await
    }

    fn numbered(count: usize) -> Vec<RawRecord> {
        (0..count)
            .map(|i| {
                let mut record = RawRecord::new();
                record.insert("n".into(), json!(i));
                record
            })
            .collect()
    }

    async fn drain<S>(chunker: &mut Chunker<S>) -> Vec<Batch>
    where
        S: Stream<Item = IngestResult<RawRecord>> + Unpin,
    {
        let mut batches = Vec::new();
        while let Some(batch) = chunker.next_batch().await.unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_decodes_objects_and_skips_blank_lines() {
        let records = collect("{\"a\":1}\n\n   \n{\"a\":2}\n").await;
        let records: Vec<_> = records.into_iter().map(Result::unwrap).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["a"], json!(2));
    }

    #[tokio::test]
    async fn test_malformed_line_reports_line_number() {
        let records = collect("{\"a\":1}\n{oops\n").await;
        match &records[1] {
            Err(IngestError::Decode { line, .. }) => assert_eq!(*line, 2),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_object_line_is_a_decode_error() {
        let records = collect("\n[1,2]\n").await;
        match &records[0] {
            Err(IngestError::Decode { line, message }) => {
                assert_eq!(*line, 2);
                assert!(message.contains("an array"));
            },
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_final_short_batch_is_delivered() {
        let source = futures::stream::iter(numbered(5).into_iter().map(Ok));
        let mut chunker = Chunker::new(source, NonZeroUsize::new(2).unwrap());

        let sizes: Vec<_> = drain(&mut chunker).await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(chunker.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_source_yields_no_batches() {
        let source = futures::stream::iter(Vec::<IngestResult<RawRecord>>::new());
        let mut chunker = Chunker::new(source, NonZeroUsize::new(3).unwrap());
        assert!(drain(&mut chunker).await.is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_stops_the_chunker() {
        let mut chunker = Chunker::new(
            Box::pin(ndjson_records(reader("{\"a\":1}\nnope\n{\"a\":3}\n"))),
            NonZeroUsize::new(10).unwrap(),
        );

        assert!(matches!(
            chunker.next_batch().await,
            Err(IngestError::Decode { line: 2, .. })
        ));
        assert!(chunker.next_batch().await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_batches_partition_input_in_order(len in 0usize..200, size in 1usize..40) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let input = numbered(len);
            let source = futures::stream::iter(input.clone().into_iter().map(Ok));
            let mut chunker = Chunker::new(source, NonZeroUsize::new(size).unwrap());

            let batches = runtime.block_on(drain(&mut chunker));

            prop_assert_eq!(batches.len(), len.div_ceil(size));
            if let Some((last, full)) = batches.split_last() {
                prop_assert!(full.iter().all(|b| b.len() == size));
                prop_assert!(!last.is_empty() && last.len() <= size);
            }
            let flattened: Vec<RawRecord> = batches.into_iter().flatten().collect();
            prop_assert_eq!(flattened, input);
        }
    }
}
