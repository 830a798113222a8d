//! Watch fan-out: one upstream watch per namespace, merged onto a single
//! newline-delimited JSON stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};

use crate::error::Result;
use crate::upstream::{Gvr, ListOptions, UpstreamApi, WatchStream};

/// Opens one upstream watch per namespace (a single cluster-scoped watch
/// when the set is empty) and returns a streaming body that interleaves
/// their events in arrival order.
///
/// Watches are opened before the response head is committed so an open
/// failure can still pick the status code. Once streaming has begun, worker
/// errors tear the stream down and are logged only. Dropping the body (the
/// client disconnecting) cancels every worker.
pub async fn aggregate_watch(
    upstream: Arc<dyn UpstreamApi>,
    gvr: Gvr,
    namespaces: Vec<String>,
    opts: ListOptions,
) -> Result<Body> {
    let watchers = open_watchers(upstream.as_ref(), &gvr, &namespaces, &opts).await?;
    debug!(resource = %gvr.resource, watches = watchers.len(), "starting watch stream");

    let cancel = CancellationToken::new();
    // Capacity one: a slow client backpressures every worker.
    let (events, merged) = mpsc::channel::<std::io::Result<Bytes>>(1);

    for mut watcher in watchers {
        let events = events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watcher.next() => match event {
                        Some(Ok(event)) => {
                            let mut line = match serde_json::to_vec(&event) {
                                Ok(line) => line,
                                Err(err) => {
                                    error!(error = %err, "could not encode watch event");
                                    cancel.cancel();
                                    break;
                                }
                            };
                            line.push(b'\n');
                            if events.send(Ok(Bytes::from(line))).await.is_err() {
                                debug!("client disconnected, stopping watch worker");
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            error!(error = %err, "watch error, terminating stream");
                            cancel.cancel();
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
    }

    Ok(Body::from_stream(EventStream {
        inner: ReceiverStream::new(merged),
        _cancel_on_drop: cancel.drop_guard(),
    }))
}

async fn open_watchers(
    upstream: &dyn UpstreamApi,
    gvr: &Gvr,
    namespaces: &[String],
    opts: &ListOptions,
) -> Result<Vec<WatchStream>> {
    if namespaces.is_empty() {
        return Ok(vec![upstream.watch(gvr, None, opts).await?]);
    }
    futures::future::try_join_all(
        namespaces
            .iter()
            .map(|namespace| upstream.watch(gvr, Some(namespace.as_str()), opts)),
    )
    .await
}

/// The merged event stream; dropping it cancels all watch workers.
struct EventStream {
    inner: ReceiverStream<std::io::Result<Bytes>>,
    _cancel_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use kube::core::WatchEvent;
    use serde_json::{json, Value};

    use crate::error::Error;

    enum WatchBehavior {
        /// Yield these events, then end the stream.
        Events(Vec<WatchEvent<Value>>),
        /// Never yield; count opens and closes.
        Hang(Arc<AtomicUsize>),
        /// Fail the open call.
        FailOpen,
        /// Yield a single stream error.
        ErrorEvent,
    }

    #[derive(Default)]
    struct StubUpstream {
        watches: HashMap<Option<String>, WatchBehavior>,
    }

    impl StubUpstream {
        fn with(mut self, namespace: Option<&str>, behavior: WatchBehavior) -> Self {
            self.watches.insert(namespace.map(String::from), behavior);
            self
        }
    }

    /// Stream wrapper that decrements a counter when dropped, making worker
    /// shutdown observable.
    struct TrackedStream {
        open: Arc<AtomicUsize>,
    }

    impl Stream for TrackedStream {
        type Item = kube::Result<WatchEvent<Value>>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }

    impl Drop for TrackedStream {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UpstreamApi for StubUpstream {
        async fn list<'a>(
            &self,
            _gvr: &'a Gvr,
            _namespace: Option<&'a str>,
            _opts: &'a ListOptions,
        ) -> Result<Value> {
            unreachable!("watch tests never list")
        }

        async fn watch<'a>(
            &self,
            _gvr: &'a Gvr,
            namespace: Option<&'a str>,
            _opts: &'a ListOptions,
        ) -> Result<WatchStream> {
            match self.watches.get(&namespace.map(String::from)) {
                Some(WatchBehavior::Events(events)) => {
                    let events: Vec<kube::Result<WatchEvent<Value>>> =
                        events.iter().cloned().map(Ok).collect();
                    Ok(Box::pin(stream::iter(events)))
                }
                Some(WatchBehavior::Hang(open)) => {
                    open.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::pin(TrackedStream {
                        open: Arc::clone(open),
                    }))
                }
                Some(WatchBehavior::FailOpen) => Err(Error::NotFound(format!(
                    "namespaces \"{}\" not found",
                    namespace.unwrap_or_default()
                ))),
                Some(WatchBehavior::ErrorEvent) => {
                    let resp: kube::core::ErrorResponse = serde_json::from_value(json!({
                        "status": "Failure",
                        "message": "watch expired",
                        "reason": "Expired",
                        "code": 410,
                        "metadata": {}
                    }))
                    .unwrap();
                    Ok(Box::pin(stream::iter(vec![Err(kube::Error::Api(resp))])))
                }
                None => Err(Error::Upstream("unexpected watch call".to_string())),
            }
        }
    }

    fn pods_gvr() -> Gvr {
        Gvr {
            group: String::new(),
            version: "v1".to_string(),
            resource: "pods".to_string(),
        }
    }

    fn added(namespace: &str, name: &str) -> WatchEvent<Value> {
        WatchEvent::Added(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"namespace": namespace, "name": name},
        }))
    }

    async fn body_lines(body: Body) -> Vec<Value> {
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn merges_events_from_every_namespace() {
        let upstream = StubUpstream::default()
            .with(
                Some("team-a"),
                WatchBehavior::Events(vec![added("team-a", "p1")]),
            )
            .with(
                Some("team-a-child"),
                WatchBehavior::Events(vec![added("team-a-child", "p1")]),
            );
        let body = aggregate_watch(
            Arc::new(upstream),
            pods_gvr(),
            vec!["team-a".to_string(), "team-a-child".to_string()],
            ListOptions::default(),
        )
        .await
        .unwrap();

        let mut events = body_lines(body).await;
        assert_eq!(events.len(), 2);
        events.sort_by_key(|e| e["object"]["metadata"]["namespace"].as_str().map(String::from));
        for event in &events {
            assert_eq!(event["type"], "ADDED");
        }
        assert_eq!(events[0]["object"]["metadata"]["namespace"], "team-a");
        assert_eq!(events[1]["object"]["metadata"]["namespace"], "team-a-child");
    }

    #[tokio::test]
    async fn empty_namespace_set_opens_cluster_watch() {
        let upstream = StubUpstream::default().with(
            None,
            WatchBehavior::Events(vec![added("anywhere", "p1")]),
        );
        let body = aggregate_watch(
            Arc::new(upstream),
            pods_gvr(),
            vec![],
            ListOptions::default(),
        )
        .await
        .unwrap();

        let events = body_lines(body).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn open_failure_fails_the_request() {
        let upstream = StubUpstream::default()
            .with(
                Some("team-a"),
                WatchBehavior::Events(vec![added("team-a", "p1")]),
            )
            .with(Some("gone"), WatchBehavior::FailOpen);
        let err = aggregate_watch(
            Arc::new(upstream),
            pods_gvr(),
            vec!["team-a".to_string(), "gone".to_string()],
            ListOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stream_error_terminates_every_worker() {
        let open = Arc::new(AtomicUsize::new(0));
        let upstream = StubUpstream::default()
            .with(Some("bad"), WatchBehavior::ErrorEvent)
            .with(Some("slow"), WatchBehavior::Hang(Arc::clone(&open)));
        let body = aggregate_watch(
            Arc::new(upstream),
            pods_gvr(),
            vec!["bad".to_string(), "slow".to_string()],
            ListOptions::default(),
        )
        .await
        .unwrap();

        // The erroring worker cancels its sibling; the merged stream ends.
        let events = body_lines(body).await;
        assert!(events.is_empty());

        for _ in 0..100 {
            if open.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hung watch worker was not cancelled");
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_workers() {
        let open = Arc::new(AtomicUsize::new(0));
        let upstream = StubUpstream::default()
            .with(Some("a"), WatchBehavior::Hang(Arc::clone(&open)))
            .with(Some("b"), WatchBehavior::Hang(Arc::clone(&open)));
        let body = aggregate_watch(
            Arc::new(upstream),
            pods_gvr(),
            vec!["a".to_string(), "b".to_string()],
            ListOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 2);

        drop(body);

        for _ in 0..100 {
            if open.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch workers survived client disconnect");
    }
}
