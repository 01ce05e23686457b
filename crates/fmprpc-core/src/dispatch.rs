//! Client-side dispatch of calls and notifications.

use std::sync::Arc;

use rmpv::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::calls::{CallGuard, CallResponse, CallTable};
use crate::client::ErrorUnwrapper;
use crate::codec::encode_frame;
use crate::compress::CompressorCache;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::message::{CompressionType, RpcTags, SeqNumber, WireMessage};
use crate::metrics::TransportMetrics;
use crate::writer::FrameQueue;

/// Pulls propagated tags out of a call's context.
pub type TagsFunc = Arc<dyn Fn(&Context) -> Option<RpcTags> + Send + Sync>;

/// Invoked once the outgoing frame has been written. Calls receive their
/// sequence number; notifications receive `None`.
pub type SendNotifier = Box<dyn FnOnce(Option<SeqNumber>) + Send>;

/// Tags carried by the context itself.
pub fn context_tags(ctx: &Context) -> Option<RpcTags> {
    ctx.tags().cloned()
}

pub(crate) struct Dispatcher {
    queue: FrameQueue,
    calls: Arc<CallTable>,
    compressors: Arc<CompressorCache>,
    tags: TagsFunc,
    closed: CancellationToken,
    metrics: Arc<TransportMetrics>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: FrameQueue,
        calls: Arc<CallTable>,
        compressors: Arc<CompressorCache>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            queue,
            calls,
            compressors,
            tags: Arc::new(context_tags),
            closed: CancellationToken::new(),
            metrics,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn call(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        compression: CompressionType,
        unwrapper: &dyn ErrorUnwrapper,
        tags: Option<&TagsFunc>,
        sent: Option<SendNotifier>,
    ) -> Result<Value> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closed.is_cancelled() {
            return Err(RpcError::Eof);
        }

        // Registered before the frame exists so an early reply finds it.
        let (call, mut result_rx) = self.calls.new_call(method, compression);
        let seq = call.seq();
        self.calls.add(call);
        let _guard = CallGuard {
            table: &self.calls,
            seq,
        };

        let tags_fn = tags.unwrap_or(&self.tags);
        let tags = tags_fn(ctx);
        let msg = match compression {
            CompressionType::None => WireMessage::Call {
                seq,
                method: method.to_string(),
                arg,
                tags,
            },
            ct => WireMessage::CallCompressed {
                seq,
                compression: ct,
                method: method.to_string(),
                arg: self.compressors.compress_value(ct, &arg)?,
                tags,
            },
        };
        let frame = encode_frame(&msg)?;

        let written = tokio::select! {
            res = self.queue.enqueue(frame) => res?,
            err = ctx.done() => return Err(err),
            _ = self.closed.cancelled() => return Err(RpcError::Eof),
        };
        self.metrics.inc_calls_sent();
        tokio::select! {
            res = written => res.map_err(|_| RpcError::Eof)??,
            err = ctx.done() => {
                self.send_cancel(seq, method);
                return Err(err);
            }
            _ = self.closed.cancelled() => return Err(RpcError::Eof),
        }
        if let Some(sent) = sent {
            sent(Some(seq));
        }

        let response = tokio::select! {
            res = result_rx.recv() => res.ok_or(RpcError::Eof)?,
            err = ctx.done() => {
                self.send_cancel(seq, method);
                return Err(err);
            }
            _ = self.closed.cancelled() => return Err(RpcError::Eof),
        };

        if let Some(err) = unwrapper.unwrap_error(response.error)? {
            return Err(err);
        }
        match (compression, response.result) {
            (CompressionType::None, result) => Ok(result),
            (ct, Value::Binary(bytes)) => self.compressors.decompress_value(ct, &bytes),
            (_, Value::Nil) => Ok(Value::Nil),
            (ct, _) => Err(RpcError::Compression {
                compression: ct,
                reason: "compressed result is not binary".to_string(),
            }),
        }
    }

    pub(crate) async fn notify(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        tags: Option<&TagsFunc>,
        sent: Option<SendNotifier>,
    ) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closed.is_cancelled() {
            return Err(RpcError::Eof);
        }
        let tags_fn = tags.unwrap_or(&self.tags);
        let msg = WireMessage::Notify {
            method: method.to_string(),
            arg,
            tags: tags_fn(ctx),
        };
        let frame = encode_frame(&msg)?;
        tokio::select! {
            res = self.queue.write(frame) => res?,
            err = ctx.done() => return Err(err),
            _ = self.closed.cancelled() => return Err(RpcError::Eof),
        }
        self.metrics.inc_notifies_sent();
        if let Some(sent) = sent {
            sent(None);
        }
        Ok(())
    }

    /// Routes a `Response` to its waiting call.
    pub(crate) fn deliver(&self, seq: SeqNumber, error: Value, result: Value) -> Result<()> {
        let Some(call) = self.calls.remove(seq) else {
            self.metrics.inc_unexpected_replies();
            warn!(seq, "unexpected reply");
            return Err(RpcError::CallNotFound(seq));
        };
        self.metrics.inc_replies_received();
        if !call.deliver(CallResponse { error, result }) {
            debug!(seq, method = call.method(), "reply arrived after caller gave up");
        }
        Ok(())
    }

    fn send_cancel(&self, seq: SeqNumber, method: &str) {
        let msg = WireMessage::Cancel {
            seq,
            method: method.to_string(),
        };
        match encode_frame(&msg) {
            Ok(frame) => {
                if self.queue.try_write(frame) {
                    self.metrics.inc_cancels_sent();
                } else {
                    debug!(seq, method, "write queue full, cancel dropped");
                }
            }
            Err(e) => debug!(seq, method, error = %e, "failed to encode cancel"),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
