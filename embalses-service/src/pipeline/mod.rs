use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("record rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Everything except a per-record rejection aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Rejected(_))
    }
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    type Output: Send;

    async fn run<S>(&self, input: S) -> Result<Self::Output, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<K::Output, PipelineError> {
        let mut stream = self.source.stream().await;

        // Apply transforms in sequence (if any).
        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        self.sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSource(Vec<Result<i64, String>>);

    #[async_trait::async_trait]
    impl Source<i64> for VecSource {
        async fn stream(&self) -> EnvelopeStream<i64> {
            let items: Vec<_> = self
                .0
                .iter()
                .cloned()
                .map(|r| r.map(Envelope::new).map_err(PipelineError::Parse))
                .collect();
            Box::pin(futures::stream::iter(items))
        }
    }

    struct Double;

    #[async_trait::async_trait]
    impl Transform<i64, i64> for Double {
        async fn apply(&self, input: Envelope<i64>) -> Result<Envelope<i64>, PipelineError> {
            Ok(Envelope {
                payload: input.payload * 2,
                received_at: input.received_at,
            })
        }
    }

    struct RejectOdd;

    #[async_trait::async_trait]
    impl Transform<i64, i64> for RejectOdd {
        async fn apply(&self, input: Envelope<i64>) -> Result<Envelope<i64>, PipelineError> {
            if input.payload % 2 != 0 {
                return Err(PipelineError::Rejected(format!("{} is odd", input.payload)));
            }
            Ok(input)
        }
    }

    struct Collect;

    #[async_trait::async_trait]
    impl Sink<i64> for Collect {
        type Output = Vec<Result<i64, String>>;

        async fn run<S>(&self, mut input: S) -> Result<Self::Output, PipelineError>
        where
            S: Stream<Item = Result<Envelope<i64>, PipelineError>> + Send + Unpin + 'static,
        {
            let mut out = Vec::new();
            while let Some(item) = input.next().await {
                out.push(item.map(|e| e.payload).map_err(|e| e.to_string()));
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn transforms_apply_in_order_and_errors_pass_through() {
        let pipeline: Pipeline<_, i64, _> = Pipeline {
            source: VecSource(vec![Ok(1), Err("bad row".to_string()), Ok(3)]),
            transforms: vec![Arc::new(RejectOdd), Arc::new(Double)],
            sink: Collect,
        };

        let out = pipeline.run().await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Err("record rejected: 1 is odd".to_string()));
        assert_eq!(out[1], Err("parse error: bad row".to_string()));

        let pipeline: Pipeline<_, i64, _> = Pipeline {
            source: VecSource(vec![Ok(1), Ok(2)]),
            transforms: vec![Arc::new(Double), Arc::new(RejectOdd)],
            sink: Collect,
        };
        let out = pipeline.run().await.unwrap();
        assert_eq!(out, vec![Ok(2), Ok(4)]);
    }

    #[test]
    fn only_rejections_are_non_fatal() {
        assert!(!PipelineError::Rejected("x".into()).is_fatal());
        assert!(PipelineError::Parse("x".into()).is_fatal());
        assert!(PipelineError::Network("x".into()).is_fatal());
        assert!(PipelineError::Storage("x".into()).is_fatal());
    }
}
