use std::sync::Arc;

use parking_lot::Mutex;
use spark_buffer::ByteBuf;
use spark_channel::embedded::EmbeddedChannel;
use spark_channel::{
    BatchingPendingWriteQueue, ChannelError, ChannelFuture, ChannelHandler, ChannelHandlerContext, ChannelPromise,
    CoalescingBufferQueue, CompositionStrategy, EventMask, PendingWriteQueue, PipelineMessage, UserEvent,
    WriteBufferWaterMark,
};

/// 放行截留写入的用户事件。
struct Open;

fn is_open_event(event: &UserEvent) -> bool {
    event.downcast_ref::<Open>().is_some()
}

fn buf(bytes: &'static [u8]) -> PipelineMessage {
    PipelineMessage::from(ByteBuf::from_static(bytes))
}

fn written_bytes(embedded: &EmbeddedChannel) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| embedded.read_outbound())
        .map(|msg| {
            let buf = msg.into_buffer().unwrap_or_else(|_| panic!("应写出字节缓冲"));
            let bytes = buf.to_vec().expect("缓冲可读");
            spark_buffer::ReferenceCounted::release(&buf).expect("释放成功");
            bytes
        })
        .collect()
}

/// 在收到 [`Open`] 之前截留全部写入。
#[derive(Default)]
struct Gate {
    queue: Mutex<Option<PendingWriteQueue>>,
}

impl Gate {
    fn queued(&self) -> usize {
        self.queue.lock().as_ref().map_or(0, PendingWriteQueue::len)
    }
}

impl ChannelHandler for Gate {
    fn interest(&self) -> EventMask {
        EventMask::WRITE | EventMask::USER_EVENT_TRIGGERED
    }

    fn handler_added(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        *self.queue.lock() = Some(PendingWriteQueue::new(ctx));
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        if let Some(mut queue) = self.queue.lock().take() {
            queue.remove_and_fail_all(&ChannelError::Closed);
        }
        Ok(())
    }

    fn write(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> spark_channel::Result<()> {
        match self.queue.lock().as_mut() {
            Some(queue) => queue.add(msg, promise),
            None => return ctx.write_with_promise(msg, promise).map(drop),
        }
        Ok(())
    }

    fn user_event_triggered(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        event: UserEvent,
    ) -> spark_channel::Result<()> {
        if !is_open_event(&event) {
            ctx.fire_user_event_triggered(event);
            return Ok(());
        }
        let released = self.queue.lock().as_mut().and_then(PendingWriteQueue::remove_and_write_all);
        if released.is_some() {
            ctx.flush();
        }
        Ok(())
    }
}

fn gated() -> (EmbeddedChannel, Arc<Gate>) {
    let gate = Arc::new(Gate::default());
    let embedded = EmbeddedChannel::new(vec![Arc::clone(&gate) as Arc<dyn ChannelHandler>]).expect("注册应成功");
    embedded
        .channel()
        .config()
        .set_write_buffer_water_mark(WriteBufferWaterMark::new(8, 16).expect("水位线合法"))
        .expect("配置应生效");
    (embedded, gate)
}

#[test]
fn held_writes_count_towards_backpressure_until_released() {
    let (embedded, gate) = gated();
    let futures: Vec<ChannelFuture> = [b"012345", b"abcdef", b"uvwxyz"]
        .into_iter()
        .map(|bytes| embedded.channel().write_and_flush(buf(bytes)))
        .collect();
    embedded.run_pending_tasks();

    assert_eq!(gate.queued(), 3);
    assert_eq!(embedded.outbound_len(), 0);
    assert_eq!(embedded.channel().total_pending_write_bytes(), 18);
    assert!(!embedded.channel().is_writable());
    assert!(futures.iter().all(|future| !future.is_done()));

    embedded.pipeline().fire_user_event_triggered(Box::new(Open));
    embedded.run_pending_tasks();

    assert_eq!(gate.queued(), 0);
    assert!(futures.iter().all(ChannelFuture::is_success));
    assert_eq!(embedded.channel().total_pending_write_bytes(), 0);
    assert!(embedded.channel().is_writable());
    assert_eq!(
        written_bytes(&embedded),
        [b"012345".to_vec(), b"abcdef".to_vec(), b"uvwxyz".to_vec()]
    );
}

#[test]
fn removing_the_holder_fails_held_writes() {
    let (embedded, gate) = gated();
    let future = embedded.channel().write(buf(b"stranded"));
    assert_eq!(embedded.channel().total_pending_write_bytes(), 8);

    embedded.pipeline().remove("Gate#0").expect("移除应成功");
    embedded.run_pending_tasks();

    assert!(matches!(future.cause(), Some(ChannelError::Closed)));
    assert_eq!(gate.queued(), 0);
    assert_eq!(embedded.channel().total_pending_write_bytes(), 0);
}

#[test]
fn other_user_events_pass_through_the_gate() {
    let (embedded, _) = gated();
    embedded.pipeline().fire_user_event_triggered(Box::new("unrelated"));
    embedded.run_pending_tasks();
    let events = embedded.take_user_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].downcast_ref::<&str>(), Some(&"unrelated"));
}

/// 截留写入并把相邻小缓冲合并，收到 [`Open`] 后放行。
struct BatchingGate {
    max_size: u64,
    queue: Mutex<Option<BatchingPendingWriteQueue>>,
}

impl ChannelHandler for BatchingGate {
    fn interest(&self) -> EventMask {
        EventMask::WRITE | EventMask::USER_EVENT_TRIGGERED
    }

    fn handler_added(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        *self.queue.lock() = Some(BatchingPendingWriteQueue::new(ctx, self.max_size));
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        if let Some(mut queue) = self.queue.lock().take() {
            queue.remove_and_fail_all(&ChannelError::Closed);
        }
        Ok(())
    }

    fn write(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> spark_channel::Result<()> {
        match self.queue.lock().as_mut() {
            Some(queue) => queue.add(msg, promise),
            None => return ctx.write_with_promise(msg, promise).map(drop),
        }
        Ok(())
    }

    fn user_event_triggered(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        event: UserEvent,
    ) -> spark_channel::Result<()> {
        if !is_open_event(&event) {
            ctx.fire_user_event_triggered(event);
            return Ok(());
        }
        let released = self
            .queue
            .lock()
            .as_mut()
            .and_then(BatchingPendingWriteQueue::remove_and_write_all);
        if released.is_some() {
            ctx.flush();
        }
        Ok(())
    }
}

#[test]
fn adjacent_small_buffers_are_batched_up_to_the_limit() {
    let gate = Arc::new(BatchingGate {
        max_size: 8,
        queue: Mutex::new(None),
    });
    let embedded = EmbeddedChannel::new(vec![Arc::clone(&gate) as Arc<dyn ChannelHandler>]).expect("注册应成功");
    let futures: Vec<ChannelFuture> = [&b"ab"[..], b"cd", b"efgh", b"ijklmno"]
        .into_iter()
        .map(|bytes| embedded.channel().write(PipelineMessage::from(ByteBuf::copy_from_slice(bytes))))
        .collect();
    assert_eq!(gate.queue.lock().as_ref().map(BatchingPendingWriteQueue::len), Some(2));
    assert_eq!(embedded.channel().total_pending_write_bytes(), 15);

    embedded.pipeline().fire_user_event_triggered(Box::new(Open));
    embedded.run_pending_tasks();

    assert!(futures.iter().all(ChannelFuture::is_success));
    assert_eq!(embedded.transport().written_sizes(), [8, 7]);
    assert_eq!(written_bytes(&embedded), [b"abcdefgh".to_vec(), b"ijklmno".to_vec()]);
    assert_eq!(embedded.channel().total_pending_write_bytes(), 0);
}

#[test]
fn user_messages_are_never_batched() {
    let gate = Arc::new(BatchingGate {
        max_size: 1024,
        queue: Mutex::new(None),
    });
    let embedded = EmbeddedChannel::new(vec![Arc::clone(&gate) as Arc<dyn ChannelHandler>]).expect("注册应成功");
    embedded.channel().write(buf(b"head"));
    embedded.channel().write(PipelineMessage::user(42_u32));
    embedded.channel().write(buf(b"tail"));
    assert_eq!(gate.queue.lock().as_ref().map(BatchingPendingWriteQueue::len), Some(3));

    embedded.pipeline().remove("BatchingGate#0").expect("移除应成功");
    assert_eq!(embedded.channel().total_pending_write_bytes(), 0);
}

/// 把任意批次的写入重新切分为固定大小的帧，在 flush 时写出完整帧。
struct Framer {
    frame: u64,
    queue: Mutex<Option<CoalescingBufferQueue>>,
}

impl ChannelHandler for Framer {
    fn interest(&self) -> EventMask {
        EventMask::WRITE | EventMask::FLUSH
    }

    fn handler_added(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        *self.queue.lock() = Some(CoalescingBufferQueue::new(ctx.try_channel(), CompositionStrategy::Copy));
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        if let Some(mut queue) = self.queue.lock().take() {
            queue.release_and_fail_all(&ChannelError::Closed);
        }
        Ok(())
    }

    fn write(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> spark_channel::Result<()> {
        let buf = match msg.into_buffer() {
            Ok(buf) => buf,
            Err(other) => return ctx.write_with_promise(other, promise).map(drop),
        };
        match self.queue.lock().as_mut() {
            Some(queue) => queue.add_with_promise(buf, Some(promise)),
            None => return ctx.write_with_promise(buf.into(), promise).map(drop),
        }
        Ok(())
    }

    fn flush(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        let mut frames = Vec::new();
        if let Some(queue) = self.queue.lock().as_mut() {
            while queue.readable_bytes() >= self.frame {
                let aggregate = ctx.new_promise();
                let frame = queue.remove(self.frame, &aggregate)?;
                frames.push((frame, aggregate));
            }
        }
        for (frame, aggregate) in frames {
            ctx.write_with_promise(frame.into(), aggregate)?;
        }
        ctx.flush();
        Ok(())
    }
}

#[test]
fn coalescing_queue_reframes_writes_by_size() {
    let framer = Arc::new(Framer {
        frame: 4,
        queue: Mutex::new(None),
    });
    let embedded = EmbeddedChannel::new(vec![Arc::clone(&framer) as Arc<dyn ChannelHandler>]).expect("注册应成功");
    let first = embedded.channel().write(buf(b"abcdef"));
    let second = embedded.channel().write(buf(b"gh"));
    let third = embedded.channel().write(buf(b"ij"));
    assert_eq!(embedded.channel().total_pending_write_bytes(), 10);

    embedded.flush_outbound();
    assert_eq!(written_bytes(&embedded), [b"abcd".to_vec(), b"efgh".to_vec()]);
    assert!(first.is_success());
    assert!(second.is_success());
    assert!(!third.is_done(), "不足一帧的尾部留在队列中");
    assert_eq!(embedded.channel().total_pending_write_bytes(), 2);

    embedded.pipeline().remove("Framer#0").expect("移除应成功");
    assert!(matches!(third.cause(), Some(ChannelError::Closed)));
    assert_eq!(embedded.channel().total_pending_write_bytes(), 0);
}
