//! 延迟执行流的 Step 链与驱动循环。
//!
//! # 设计背景（Why）
//! - 延迟流是一条只追加的单向链：每次链式调用创建新 Step，挂到当前尾部的 `next` 上；
//! - “为 Step 产出输出”与“为 Step 挂载后继”可能在不同线程上同时发生。两者对称：
//!   谁后到，谁负责把输出交给后继并继续向前驱动。
//!
//! # 逻辑解析（How）
//! - 每个 Step 持有一个 `AtomicU8` 状态位：`HAS_OUTPUT`、`HAS_NEXT` 两个位分别由
//!   `publish`、`attach` 通过 `fetch_or` 置位，返回的旧值唯一确定“后到者”；
//! - 输出与后继各自存放在一次性槽位中，槽位锁只覆盖写入/取出瞬间；
//! - `DRAINED`（两位皆置）表示输出已交付，之后任何重复写入都会回滚自己的写入并报错；
//! - 驱动循环以迭代方式沿链前进，长同步链不会增长调用栈；
//! - Step 之间传递 [`Delivery`]：结果之外还携带沿链拼接进来的子流上下文，
//!   下游变换在“链式调用时的上下文 + 随结果到达的上下文”中执行。
//!
//! # 契约说明（What）
//! - 每个 Step 的 `apply` 至多执行一次；
//! - 每个 Step 的输出至多被交付一次，且恰好由一个线程交付；
//! - 重复完成返回 `flow.already_completed`，重复挂载返回 `flow.already_attached`。

use std::{any::Any, sync::Arc};

use crate::{
    context::PropagatedContext,
    error::{FlowError, catch_user_fault, codes},
    sync::{AtomicU8, Ordering, Slot},
};

/// 类型擦除后的值。
pub(crate) type Erased = Box<dyn Any + Send>;

/// 类型擦除后的结果：`Ok(None)` 表示“成功但无值”。
pub(crate) type ErasedOutcome = Result<Option<Erased>, FlowError>;

/// Step 之间传递的载荷。
///
/// `context` 只包含运行期经 `flat_map`/`on_error_resume` 拼接进来的子流条目；
/// 链式调用时已知的条目由各个变换闭包自行捕获。
pub(crate) struct Delivery {
    pub(crate) outcome: ErasedOutcome,
    pub(crate) context: PropagatedContext,
}

impl Delivery {
    pub(crate) fn new(outcome: ErasedOutcome, context: PropagatedContext) -> Self {
        Self { outcome, context }
    }

    /// 不携带拼接上下文的载荷。
    pub(crate) fn bare(outcome: ErasedOutcome) -> Self {
        Self::new(outcome, PropagatedContext::default())
    }

    /// 以 `base` 为底合并本载荷的上下文，本载荷的条目优先。
    fn spliced(self, base: &PropagatedContext) -> Self {
        Self {
            outcome: self.outcome,
            context: base.merge(&self.context),
        }
    }
}

/// Step 的变换逻辑。
pub(crate) type Apply = Box<dyn FnOnce(Delivery) -> Transition + Send>;

/// `apply` 的执行结果。
pub(crate) enum Transition {
    /// 结果已就绪，直接交给当前 Step。
    Ready(Delivery),
    /// 需要等待另一条链的尾部，其输出即当前 Step 的输出；
    /// 附带的上下文在子链输出到达时作为其底层条目合并。
    Await(Arc<Step>, PropagatedContext),
}

/// 非阻塞探测的结果。
pub(crate) enum Readiness<R> {
    /// 尚无输出。
    Pending,
    /// 输出已就位。
    Ready(R),
    /// 输出已被后继或其他读端取走。
    Consumed,
}

const PENDING: u8 = 0b00;
const HAS_OUTPUT: u8 = 0b01;
const HAS_NEXT: u8 = 0b10;
const DRAINED: u8 = HAS_OUTPUT | HAS_NEXT;

/// 输出发布后的交接结果。
enum Handoff {
    /// 后继尚未挂载，输出留在 Step 中。
    Parked,
    /// 当前线程是后到者，需要继续驱动后继。
    Drive(Arc<Step>, Delivery),
}

pub(crate) struct Step {
    state: AtomicU8,
    output: Slot<Delivery>,
    next: Slot<Arc<Step>>,
    apply: Slot<Apply>,
}

impl Step {
    /// 无变换逻辑的 Step，用作 `DelayedFlow` 的链头。
    pub(crate) fn pending() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            output: Slot::empty(),
            next: Slot::empty(),
            apply: Slot::empty(),
        }
    }

    pub(crate) fn with_apply(apply: Apply) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            output: Slot::empty(),
            next: Slot::empty(),
            apply: Slot::filled(apply),
        }
    }

    /// 中继 Step：把子链的输出转交给 `target`，`base` 作为其底层上下文。
    fn relay(target: Arc<Step>, base: PropagatedContext) -> Self {
        Self::with_apply(Box::new(move |delivery: Delivery| {
            target.complete(delivery.spliced(&base));
            Transition::Ready(Delivery::bare(Ok(None)))
        }))
    }

    /// 为 Step 产出输出；若后继已就位，则在当前线程继续驱动。
    pub(crate) fn try_complete(&self, delivery: Delivery) -> Result<(), FlowError> {
        match self.publish(delivery)? {
            Handoff::Parked => Ok(()),
            Handoff::Drive(next, input) => {
                drive(next, input);
                Ok(())
            }
        }
    }

    /// 内部完成入口：重复完成只记录告警。
    fn complete(&self, delivery: Delivery) {
        if let Err(error) = self.try_complete(delivery) {
            tracing::warn!(code = error.code(), "discarded flow output: {}", error.message());
        }
    }

    /// 挂载后继。
    ///
    /// # 契约说明（What）
    /// - 若输出已经就位，后继的 `apply` 会在当前线程上同步执行；
    /// - 槽位已被占用，或输出已被其他消费者取走时，返回 `flow.already_attached`，
    ///   此时 `next` 不会被执行。
    pub(crate) fn attach(&self, next: Arc<Step>) -> Result<(), FlowError> {
        if self.next.put_if_empty(next).is_err() {
            tracing::warn!("rejected second continuation on flow step");
            return Err(FlowError::already_attached());
        }
        let previous = self.state.fetch_or(HAS_NEXT, Ordering::AcqRel);
        if previous & HAS_NEXT != 0 {
            // 输出已被交付或被探测取走，收回本次写入。
            drop(self.next.take());
            tracing::warn!("rejected continuation on drained flow step");
            return Err(FlowError::already_attached());
        }
        if previous & HAS_OUTPUT != 0 {
            let (next, input) = self.drain()?;
            drive(next, input);
        }
        Ok(())
    }

    /// 非阻塞读取：输出已就位时以 `read` 读取其引用，Step 状态保持不变。
    ///
    /// # 契约说明（What）
    /// - 未完成返回 `Pending`；已交付给后继或已被取走返回 `Consumed`；
    /// - `read` 在槽位锁内执行，只应做克隆之类的短小读取。
    pub(crate) fn peek<R>(&self, read: impl FnOnce(&Delivery) -> R) -> Readiness<R> {
        match self.state.load(Ordering::Acquire) {
            HAS_OUTPUT => match self.output.inspect(read) {
                Some(value) => Readiness::Ready(value),
                // 状态读取与加锁之间输出被后继取走。
                None => Readiness::Consumed,
            },
            DRAINED => Readiness::Consumed,
            _ => Readiness::Pending,
        }
    }

    /// 取走输出：输出已就位且无后继时取出，并将 Step 标记为已交付。
    ///
    /// 取走后该 Step 只剩“已消费”状态，之后的挂载得到 `flow.already_attached`。
    pub(crate) fn try_take_output(&self) -> Readiness<Delivery> {
        match self
            .state
            .compare_exchange(HAS_OUTPUT, DRAINED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.output.take().map_or(Readiness::Consumed, Readiness::Ready),
            Err(DRAINED) => Readiness::Consumed,
            Err(_) => Readiness::Pending,
        }
    }

    fn publish(&self, delivery: Delivery) -> Result<Handoff, FlowError> {
        if self.output.put_if_empty(delivery).is_err() {
            return Err(FlowError::already_completed());
        }
        let previous = self.state.fetch_or(HAS_OUTPUT, Ordering::AcqRel);
        if previous & HAS_OUTPUT != 0 {
            // 先前的输出已被交付，槽位中只剩本次写入。
            drop(self.output.take());
            return Err(FlowError::already_completed());
        }
        if previous & HAS_NEXT != 0 {
            let (next, input) = self.drain()?;
            return Ok(Handoff::Drive(next, input));
        }
        Ok(Handoff::Parked)
    }

    fn drain(&self) -> Result<(Arc<Step>, Delivery), FlowError> {
        match (self.next.take(), self.output.take()) {
            (Some(next), Some(output)) => Ok((next, output)),
            _ => {
                tracing::error!("flow step drained without both output and continuation");
                Err(FlowError::new(
                    codes::ILLEGAL_STATE,
                    "flow step drained without both output and continuation",
                ))
            }
        }
    }
}

impl Drop for Step {
    // 未驱动的长链逐节拆除，避免递归析构。
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(step) = next {
            next = match Arc::try_unwrap(step) {
                Ok(owned) => owned.next.take(),
                Err(_) => None,
            };
        }
    }
}

/// 沿链驱动：执行 `step` 的变换，把结果发布到 `step`，若后继已就位则继续。
///
/// 遇到尚未完成的子链时挂载中继 Step 并立即返回，由子链的完成者接续驱动。
pub(crate) fn drive(mut step: Arc<Step>, mut input: Delivery) {
    let mut hops = 0_usize;
    loop {
        hops += 1;
        let output = match step.apply.take() {
            None => input,
            Some(apply) => {
                let carried = input.context.clone();
                match catch_user_fault(move || apply(input)) {
                    Ok(Transition::Ready(output)) => output,
                    Ok(Transition::Await(sub, base)) => match sub.try_take_output() {
                        Readiness::Ready(output) => output.spliced(&base),
                        Readiness::Consumed => Delivery::new(Err(FlowError::already_attached()), base),
                        Readiness::Pending => {
                            let relay = Arc::new(Step::relay(Arc::clone(&step), base.clone()));
                            match sub.attach(relay) {
                                Ok(()) => {
                                    tracing::trace!(hops, "flow chain parked on pending sub-flow");
                                    return;
                                }
                                Err(error) => Delivery::new(Err(error), base),
                            }
                        }
                    },
                    Err(fault) => {
                        tracing::warn!(code = fault.code(), "flow step failed: {}", fault.message());
                        Delivery::new(Err(fault), carried)
                    }
                }
            }
        };

        match step.publish(output) {
            Ok(Handoff::Parked) => {
                tracing::trace!(hops, "flow chain parked awaiting continuation");
                return;
            }
            Ok(Handoff::Drive(next, next_input)) => {
                step = next;
                input = next_input;
            }
            Err(error) => {
                tracing::warn!(code = error.code(), "flow step output rejected: {}", error.message());
                return;
            }
        }
    }
}

/// 擦除类型。
pub(crate) fn erase<T: Send + 'static>(outcome: Result<Option<T>, FlowError>) -> ErasedOutcome {
    outcome.map(|value| value.map(|value| Box::new(value) as Erased))
}

/// 还原类型；下转型失败返回 `flow.type_mismatch`。
pub(crate) fn restore<T: 'static>(outcome: ErasedOutcome) -> Result<Option<T>, FlowError> {
    match outcome? {
        None => Ok(None),
        Some(value) => value
            .downcast::<T>()
            .map(|value| Some(*value))
            .map_err(|_| type_mismatch::<T>()),
    }
}

/// 以克隆方式还原类型，原结果保持不动。
pub(crate) fn restore_cloned<T: Clone + 'static>(
    outcome: &ErasedOutcome,
) -> Result<Option<T>, FlowError> {
    match outcome {
        Err(error) => Err(error.clone()),
        Ok(None) => Ok(None),
        Ok(Some(value)) => (**value)
            .downcast_ref::<T>()
            .cloned()
            .map(Some)
            .ok_or_else(type_mismatch::<T>),
    }
}

fn type_mismatch<T>() -> FlowError {
    FlowError::new(
        codes::TYPE_MISMATCH,
        format!("flow output is not of type `{}`", std::any::type_name::<T>()),
    )
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering as StdOrdering},
    };

    use super::*;

    fn counting_step(counter: Arc<AtomicUsize>) -> Arc<Step> {
        Arc::new(Step::with_apply(Box::new(move |input| {
            counter.fetch_add(1, StdOrdering::SeqCst);
            Transition::Ready(input)
        })))
    }

    fn value<T: Send + 'static>(value: T) -> Delivery {
        Delivery::bare(erase(Ok(Some(value))))
    }

    #[test]
    fn complete_then_attach_drives_on_attaching_thread() {
        let head = Step::pending();
        head.try_complete(value(5_i32)).expect("首次完成应成功");

        let counter = Arc::new(AtomicUsize::new(0));
        let next = counting_step(Arc::clone(&counter));
        head.attach(Arc::clone(&next)).expect("首次挂载应成功");

        assert_eq!(counter.load(StdOrdering::SeqCst), 1);
        let Readiness::Ready(output) = next.try_take_output() else {
            panic!("后继应已持有输出");
        };
        assert_eq!(restore::<i32>(output.outcome), Ok(Some(5)));
    }

    #[test]
    fn peek_leaves_output_in_place() {
        let head = Step::pending();
        assert!(matches!(head.peek(|_| ()), Readiness::Pending));
        head.try_complete(value(9_u32)).expect("首次完成应成功");

        for _ in 0..2 {
            let Readiness::Ready(seen) = head.peek(|delivery| restore_cloned::<u32>(&delivery.outcome))
            else {
                panic!("输出应仍在原位");
            };
            assert_eq!(seen, Ok(Some(9)));
        }

        let counter = Arc::new(AtomicUsize::new(0));
        head.attach(counting_step(Arc::clone(&counter))).expect("探测后仍可挂载");
        assert_eq!(counter.load(StdOrdering::SeqCst), 1);
        assert!(matches!(head.peek(|_| ()), Readiness::Consumed), "交付后应报告已消费");
    }

    #[test]
    fn second_completion_is_rejected_after_drain() {
        let head = Step::pending();
        let counter = Arc::new(AtomicUsize::new(0));
        head.attach(counting_step(Arc::clone(&counter))).expect("挂载应成功");
        head.try_complete(value(1_u8)).expect("首次完成应成功");

        let error = head
            .try_complete(value(2_u8))
            .expect_err("重复完成必须失败");
        assert_eq!(error.code(), codes::ALREADY_COMPLETED);
        assert_eq!(counter.load(StdOrdering::SeqCst), 1, "apply 只能执行一次");
    }

    #[test]
    #[tracing_test::traced_test]
    fn second_attach_is_rejected() {
        let head = Step::pending();
        head.attach(Arc::new(Step::pending())).expect("首次挂载应成功");
        let error = head
            .attach(Arc::new(Step::pending()))
            .expect_err("重复挂载必须失败");
        assert_eq!(error.code(), codes::ALREADY_ATTACHED);
        assert!(logs_contain("rejected second continuation"), "重复挂载应记录告警");
    }

    #[test]
    fn restore_reports_type_mismatch() {
        let error = restore::<String>(erase(Ok(Some(1_u64)))).expect_err("类型不符应失败");
        assert_eq!(error.code(), codes::TYPE_MISMATCH);
    }
}
