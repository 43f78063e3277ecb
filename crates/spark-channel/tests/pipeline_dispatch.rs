use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_channel::embedded::{EmbeddedChannel, EmbeddedTransport};
use spark_channel::{
    ChannelError, ChannelHandler, ChannelHandlerContext, ChannelPromise, DefaultEventLoop, EmbeddedEventLoop,
    EventExecutor, EventLoopConfig, EventMask, PipelineMessage,
};
use tracing_test::traced_test;

type Journal = Arc<Mutex<Vec<String>>>;

/// `Tagger` 把经过的读写与生命周期回调记入共享日志，然后原样传播。
struct Tagger {
    tag: &'static str,
    journal: Journal,
}

impl Tagger {
    fn new(tag: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            tag,
            journal: Arc::clone(journal),
        })
    }

    fn note(&self, what: &str) {
        self.journal.lock().push(format!("{}:{what}", self.tag));
    }
}

impl ChannelHandler for Tagger {
    fn handler_added(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.note("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.note("removed");
        Ok(())
    }

    fn channel_read(&self, ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> spark_channel::Result<()> {
        self.note("read");
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn write(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> spark_channel::Result<()> {
        self.note("write");
        ctx.write_with_promise(msg, promise).map(drop)
    }
}

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

fn handlers(tags: &[&'static str], journal: &Journal) -> Vec<Arc<dyn ChannelHandler>> {
    tags.iter()
        .map(|&tag| Tagger::new(tag, journal) as Arc<dyn ChannelHandler>)
        .collect()
}

#[test]
fn inbound_runs_head_to_tail_and_outbound_tail_to_head() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(handlers(&["a", "b", "c"], &journal)).expect("注册应成功");
    journal.lock().clear();

    assert!(embedded.write_inbound([PipelineMessage::user("ping")]).expect("入站不应失败"));
    assert_eq!(entries(&journal), ["a:read", "b:read", "c:read"]);
    assert_eq!(embedded.read_inbound_user::<&str>(), Some("ping"));

    journal.lock().clear();
    assert!(embedded.write_outbound([PipelineMessage::user("pong")]).expect("出站不应失败"));
    assert_eq!(entries(&journal), ["c:write", "b:write", "a:write"]);
    assert!(embedded.finish_and_release_all().expect("无未处理异常"));
}

/// 只声明了写事件的处理器；读事件绝不应到达这里。
struct WriteOnly {
    reads: Mutex<usize>,
}

impl ChannelHandler for WriteOnly {
    fn interest(&self) -> EventMask {
        EventMask::WRITE
    }

    fn channel_read(&self, ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> spark_channel::Result<()> {
        *self.reads.lock() += 1;
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

#[test]
fn handlers_without_interest_are_skipped() {
    let write_only = Arc::new(WriteOnly { reads: Mutex::new(0) });
    let embedded =
        EmbeddedChannel::new(vec![Arc::clone(&write_only) as Arc<dyn ChannelHandler>]).expect("注册应成功");
    assert!(embedded.write_inbound([PipelineMessage::user(7_u32)]).expect("入站不应失败"));
    assert_eq!(*write_only.reads.lock(), 0);
    assert_eq!(embedded.read_inbound_user::<u32>(), Some(7));
}

#[test]
fn structure_changes_before_registration_replay_in_order() {
    let journal = journal();
    let embedded = EmbeddedChannel::unregistered(Arc::new(EmbeddedTransport::new()));
    let pipeline = embedded.pipeline();
    pipeline
        .add_last(Some("a"), Tagger::new("a", &journal))
        .expect("添加应成功");
    pipeline
        .add_last(Some("b"), Tagger::new("b", &journal))
        .expect("添加应成功");
    pipeline.remove("a").expect("移除应成功");
    assert!(entries(&journal).is_empty());
    assert_eq!(pipeline.names(), ["b"]);

    embedded.register().expect("注册应成功");
    assert_eq!(entries(&journal), ["a:added", "b:added", "a:removed"]);
}

#[test]
fn unnamed_handlers_get_short_type_names() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(handlers(&["x", "y"], &journal)).expect("注册应成功");
    assert_eq!(embedded.pipeline().names(), ["Tagger#0", "Tagger#1"]);

    embedded.pipeline().remove("Tagger#0").expect("移除应成功");
    embedded
        .pipeline()
        .add_first(None, Tagger::new("z", &journal))
        .expect("添加应成功");
    assert_eq!(embedded.pipeline().names(), ["Tagger#0", "Tagger#1"]);
}

#[test]
fn duplicate_names_are_rejected() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
    let pipeline = embedded.pipeline();
    pipeline
        .add_last(Some("codec"), Tagger::new("a", &journal))
        .expect("添加应成功");
    let err = pipeline
        .add_last(Some("codec"), Tagger::new("b", &journal))
        .expect_err("重名应被拒绝");
    assert!(matches!(err, ChannelError::DuplicateHandlerName { name } if name == "codec"));
    assert_eq!(pipeline.len(), 1);
}

#[test]
fn non_sharable_instance_joins_one_pipeline_at_a_time() {
    let journal = journal();
    let shared: Arc<dyn ChannelHandler> = Tagger::new("once", &journal);
    let first = EmbeddedChannel::new(vec![Arc::clone(&shared)]).expect("注册应成功");
    let second = EmbeddedChannel::new(Vec::new()).expect("注册应成功");

    let err = second
        .pipeline()
        .add_last(None, Arc::clone(&shared))
        .expect_err("非共享处理器不得重复加入");
    assert!(matches!(err, ChannelError::HandlerAlreadyAdded { .. }));
    // 失败的添加不影响原持有者。
    assert!(first.pipeline().context_of(&shared).is_some());

    first.pipeline().remove_handler(&shared).expect("移除应成功");
    second
        .pipeline()
        .add_last(None, shared)
        .expect("移除后可再次加入");
}

/// 声明可共享的处理器。
struct Shared;

impl ChannelHandler for Shared {
    fn is_sharable(&self) -> bool {
        true
    }
}

#[test]
fn sharable_instance_may_join_several_times() {
    let shared: Arc<dyn ChannelHandler> = Arc::new(Shared);
    let embedded = EmbeddedChannel::new(vec![Arc::clone(&shared), Arc::clone(&shared)]).expect("共享处理器可重复加入");
    assert_eq!(embedded.pipeline().names(), ["Shared#0", "Shared#1"]);
}

#[test]
fn replace_adds_the_new_handler_before_removing_the_old() {
    let journal = journal();
    let embedded = EmbeddedChannel::unregistered(Arc::new(EmbeddedTransport::new()));
    embedded
        .pipeline()
        .add_last(Some("old"), Tagger::new("old", &journal))
        .expect("添加应成功");
    embedded
        .pipeline()
        .add_last(Some("tail"), Tagger::new("tail", &journal))
        .expect("添加应成功");
    embedded.register().expect("注册应成功");
    journal.lock().clear();

    let old = embedded
        .pipeline()
        .replace("old", Some("new"), Tagger::new("new", &journal))
        .expect("替换应成功");
    assert_eq!(entries(&journal), ["new:added", "old:removed"]);
    assert_eq!(embedded.pipeline().names(), ["new", "tail"]);
    assert!(embedded.pipeline().context_of(&old).is_none());

    journal.lock().clear();
    embedded
        .write_inbound([PipelineMessage::user(())])
        .expect("入站不应失败");
    assert_eq!(entries(&journal), ["new:read", "tail:read"]);
}

#[test]
fn missing_handlers_are_reported() {
    let embedded = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
    assert!(matches!(
        embedded.pipeline().remove("ghost"),
        Err(ChannelError::HandlerNotFound { .. })
    ));
    assert!(matches!(
        embedded.pipeline().remove_first(),
        Err(ChannelError::HandlerNotFound { .. })
    ));
    assert!(matches!(
        embedded.pipeline().remove_last(),
        Err(ChannelError::HandlerNotFound { .. })
    ));
    let journal = journal();
    let err = embedded
        .pipeline()
        .add_after("ghost", None, Tagger::new("a", &journal))
        .expect_err("锚点不存在");
    assert!(matches!(err, ChannelError::HandlerNotFound { name } if name == "ghost"));
}

/// `handler_added` 总是失败的处理器。
struct RefusesToJoin;

impl ChannelHandler for RefusesToJoin {
    fn handler_added(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        Err(ChannelError::handler("not today"))
    }
}

#[test]
fn failed_handler_added_removes_the_handler() {
    let embedded = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
    embedded
        .pipeline()
        .add_last(Some("refuser"), Arc::new(RefusesToJoin))
        .expect("结构变更本身成功");
    embedded.run_pending_tasks();

    let err = embedded.check_exception().expect_err("失败应以异常事件报告");
    assert!(matches!(err, ChannelError::HandlerAddedFailed { name, removed: true, .. } if name == "refuser"));
    assert!(embedded.pipeline().get("refuser").is_none());
}

/// 读回调失败的处理器；`escalate` 为真时异常回调也失败。
struct FailingReader {
    escalate: bool,
}

impl ChannelHandler for FailingReader {
    fn channel_read(&self, _ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> spark_channel::Result<()> {
        msg.release();
        Err(ChannelError::handler("malformed frame"))
    }

    fn exception_caught(&self, ctx: &Arc<ChannelHandlerContext>, cause: ChannelError) -> spark_channel::Result<()> {
        if self.escalate {
            return Err(ChannelError::handler_with_source("giving up", cause));
        }
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

#[test]
fn handler_errors_travel_as_exception_events() {
    let embedded =
        EmbeddedChannel::new(vec![Arc::new(FailingReader { escalate: false }) as Arc<dyn ChannelHandler>])
            .expect("注册应成功");
    let err = embedded
        .write_inbound([PipelineMessage::user(1_u8)])
        .expect_err("处理器错误应抵达尾部");
    assert!(matches!(err, ChannelError::Handler { .. }));
    assert_eq!(embedded.inbound_len(), 0);
}

#[traced_test]
#[test]
fn errors_from_exception_caught_are_logged_and_suppressed() {
    let embedded =
        EmbeddedChannel::new(vec![Arc::new(FailingReader { escalate: true }) as Arc<dyn ChannelHandler>])
            .expect("注册应成功");
    let readable = embedded
        .write_inbound([PipelineMessage::user(1_u8)])
        .expect("异常回调的错误不会再次传播");
    assert!(!readable);
    assert!(logs_contain("suppressed"));
}

#[test]
fn lookup_by_type_returns_the_first_match() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(vec![
        Arc::new(Shared) as Arc<dyn ChannelHandler>,
        Tagger::new("first", &journal),
        Tagger::new("second", &journal),
    ])
    .expect("注册应成功");
    let ctx = embedded.pipeline().get_by_type::<Tagger>().expect("应找到 Tagger");
    assert_eq!(ctx.handler_as::<Tagger>().map(|tagger| tagger.tag), Some("first"));
    assert_eq!(ctx.name(), "Tagger#0");
    assert!(embedded.pipeline().get_by_type::<WriteOnly>().is_none());

    let first = embedded.pipeline().first_context().expect("非空流水线");
    assert_eq!(first.name(), "Shared#0");
    let last = embedded.pipeline().last().expect("非空流水线");
    assert!(embedded.pipeline().context_of(&last).is_some_and(|ctx| ctx.name() == "Tagger#1"));
}

#[test]
fn removed_context_forwards_late_events() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(handlers(&["a", "b"], &journal)).expect("注册应成功");
    let ctx = embedded.pipeline().context("Tagger#0").expect("节点存在");
    embedded.pipeline().remove("Tagger#0").expect("移除应成功");
    assert!(ctx.is_removed());
    journal.lock().clear();

    // 仍持有已移除节点的代码继续触发事件，事件沿原先的链路到达后续处理器。
    ctx.fire_channel_read(PipelineMessage::user("late"));
    embedded.run_pending_tasks();
    assert_eq!(entries(&journal), ["b:read"]);
    assert_eq!(embedded.read_inbound_user::<&str>(), Some("late"));
}

/// 计数抵达自身的异常事件，不再向后传播。
#[derive(Default)]
struct ExceptionCounter {
    seen: Mutex<usize>,
}

impl ChannelHandler for ExceptionCounter {
    fn exception_caught(&self, _ctx: &Arc<ChannelHandlerContext>, _cause: ChannelError) -> spark_channel::Result<()> {
        *self.seen.lock() += 1;
        Ok(())
    }
}

/// 读回调失败，并在自身的 `exception_caught` 中向另一条通道注入入站消息。
struct CrossChannelRelay {
    target: Arc<spark_channel::Channel>,
}

impl ChannelHandler for CrossChannelRelay {
    fn channel_read(&self, _ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> spark_channel::Result<()> {
        msg.release();
        Err(ChannelError::handler("relay refuses reads"))
    }

    fn exception_caught(&self, _ctx: &Arc<ChannelHandlerContext>, _cause: ChannelError) -> spark_channel::Result<()> {
        self.target.pipeline().fire_channel_read(PipelineMessage::user("forwarded"));
        Ok(())
    }
}

#[test]
fn failures_on_another_channel_reach_its_own_exception_caught() {
    let counter = Arc::new(ExceptionCounter::default());
    let target = EmbeddedChannel::new(vec![
        Arc::new(FailingReader { escalate: false }) as Arc<dyn ChannelHandler>,
        Arc::clone(&counter) as Arc<dyn ChannelHandler>,
    ])
    .expect("注册应成功");
    target
        .write_inbound([PipelineMessage::user(1_u8)])
        .expect("异常已被计数处理器消费");
    assert_eq!(*counter.seen.lock(), 1);

    let relay = EmbeddedChannel::new(vec![Arc::new(CrossChannelRelay {
        target: Arc::clone(target.channel()),
    }) as Arc<dyn ChannelHandler>])
    .expect("注册应成功");
    relay
        .write_inbound([PipelineMessage::user(2_u8)])
        .expect("中继的异常在其 exception_caught 中处理完毕");
    target.run_pending_tasks();
    assert_eq!(*counter.seen.lock(), 2, "另一条通道的读失败必须抵达它自己的 exception_caught");
}

#[test]
fn replacement_keeps_the_explicit_executor() {
    let journal = journal();
    let embedded = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
    let pinned: Arc<dyn EventExecutor> = Arc::new(EmbeddedEventLoop::new());
    embedded
        .pipeline()
        .add_last_with_executor(Arc::clone(&pinned), Some("old"), Tagger::new("old", &journal))
        .expect("添加应成功");
    embedded
        .pipeline()
        .replace("old", Some("new"), Tagger::new("new", &journal))
        .expect("替换应成功");

    let executor = embedded
        .pipeline()
        .context("new")
        .and_then(|ctx| ctx.executor())
        .expect("节点存在且已注册");
    assert!(Arc::ptr_eq(&executor, &pinned), "替换后的处理器仍应运行在原执行器上");
    let channel_loop = Arc::clone(embedded.event_loop()) as Arc<dyn EventExecutor>;
    assert!(!Arc::ptr_eq(&executor, &channel_loop));
}

/// `handler_removed` 总是失败的处理器。
struct RefusesToLeave;

impl ChannelHandler for RefusesToLeave {
    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        Err(ChannelError::handler("still busy"))
    }
}

#[traced_test]
#[test]
fn rejected_executor_still_reports_handler_removed_failures() {
    let pinned = Arc::new(DefaultEventLoop::new(EventLoopConfig {
        thread_name: "pinned".to_owned(),
        quiet_period: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(1),
    }));
    let embedded = EmbeddedChannel::new(Vec::new()).expect("注册应成功");
    embedded
        .pipeline()
        .add_last_with_executor(
            Arc::clone(&pinned) as Arc<dyn EventExecutor>,
            Some("stuck"),
            Arc::new(RefusesToLeave),
        )
        .expect("添加应成功");
    // 终止前已入队的 handler_added 任务会先执行完毕。
    pinned
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
        .wait()
        .expect("事件循环应正常终止");

    embedded.pipeline().remove("stuck").expect("移除应成功");
    assert!(embedded.pipeline().get("stuck").is_none());
    assert!(logs_contain("cannot invoke handler_removed()"));
    assert!(logs_contain("handler_removed() failed after the executor rejected the task"));
}
