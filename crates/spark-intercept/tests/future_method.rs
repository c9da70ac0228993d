//! Future 策略的结果规整与失败交付。
//!
//! - **Why**：拦截链可能产出与方法声明不同的 Future 实现，边界处必须换成确切类型；
//! - **How**：以 `InlineExecutor` 构造分派器，`Stage` 转执行流时在调用线程上驱动，结果可同步断言；
//! - **What**：空值、失败、`Stage`/`Flow` 互转、转换服务兜底与转换失败各一例。

use std::{sync::Arc, thread};

use futures::executor::block_on;
use spark_flow::{DelayedFlow, Flow, FlowError, InlineExecutor, codes as flow_codes};
use spark_intercept::{
    DefaultConversionService, Dispatcher, DispatcherConfig, InterceptedMethod, MethodInvocation,
    ReturnType, Stage, Value, codes,
};

fn dispatcher_with(conversion: DefaultConversionService) -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(conversion),
        Arc::new(InlineExecutor),
    )
}

fn dispatcher() -> Dispatcher {
    dispatcher_with(DefaultConversionService::new())
}

fn stage_invocation<F>(target: F) -> MethodInvocation
where
    F: Fn() -> Result<Option<Value>, FlowError> + Send + Sync + 'static,
{
    MethodInvocation::builder("load")
        .returns(ReturnType::stage(ReturnType::of::<i32>()))
        .target(move |_| target())
        .build()
        .expect("构建应成功")
}

fn into_stage(value: Option<Value>) -> Stage {
    *value
        .expect("Future 策略总是交付一个值")
        .downcast::<Stage>()
        .expect("交付形态应为 Stage")
}

/// 第三方 Future 类型：只能经由转换服务得到。
struct Deferred(Stage);

/// ## 测试一：`handle_result(None)` 得到已完成且无值的阶段
///
/// - **意图 (Why)**：链返回空值不是错误，调用方应得到“完成但无值”；
/// - **契约 (What)**：返回的 `Stage` 以 `Ok(None)` 就绪，不会失败。
#[test]
fn null_result_resolves_to_no_value() {
    let dispatcher = dispatcher();
    let mut call = stage_invocation(|| Ok(None));
    let mut method = dispatcher.classify(&mut call);
    assert!(matches!(method, InterceptedMethod::Future(_)));

    let delivered = method.handle_result(None).expect("空值应被接受");
    let outcome = block_on(into_stage(delivered)).expect("不应失败");
    assert!(outcome.is_none());
}

/// ## 测试二：业务失败以失败阶段交付
#[test]
fn exception_becomes_failed_stage() {
    let dispatcher = dispatcher();
    let original = FlowError::new(flow_codes::APPLICATION, "not found");
    let thrown = original.clone();
    let mut call = stage_invocation(move || Err(thrown.clone()));

    let delivered = dispatcher.intercept(&mut call).expect("失败应以阶段交付而非抛出");
    let error = block_on(into_stage(delivered)).expect_err("阶段应失败");
    assert!(error.ptr_eq(&original), "阶段携带的应是原始失败");
}

/// ## 测试三：链产出非 Future 值是致命错误
#[test]
fn non_future_raw_result_is_illegal_state() {
    let dispatcher = dispatcher();
    let mut call = stage_invocation(|| Ok(Some(Box::new(5_i32))));

    let error = dispatcher
        .intercept(&mut call)
        .expect_err("形态不匹配必须立即报告");
    assert_eq!(error.code(), codes::ILLEGAL_STATE);
}

/// ## 测试四：声明 `Flow` 而链产出 `Stage` 时显式转换
#[test]
fn stage_is_converted_to_declared_flow() {
    let dispatcher = dispatcher();
    let mut call = MethodInvocation::builder("load")
        .returns(ReturnType::flow(ReturnType::of::<i32>()))
        .target(|_| Ok(Some(Box::new(Stage::ready(Ok(Some(Box::new(11_i32))))))))
        .build()
        .expect("构建应成功");

    let delivered = dispatcher
        .intercept(&mut call)
        .expect("转换应成功")
        .expect("应交付执行流");
    let flow = *delivered
        .downcast::<Flow<Value>>()
        .expect("交付形态应为 Flow<Value>");
    let value = flow
        .into_resolved()
        .ok()
        .and_then(|resolved| resolved.value())
        .expect("就绪阶段经 inline 执行器后应已完成");
    assert_eq!(value.downcast_ref::<i32>(), Some(&11));
}

/// ## 测试五：异步完成的执行流经 `Stage` 交付
///
/// - **意图 (Why)**：结果在另一线程上完成时，调用方持有的阶段应在那时就绪；
/// - **逻辑 (How)**：链返回尚未完成的 `Flow<Value>`，声明类型为 `Stage`；另一线程稍后完成它；
/// - **契约 (What)**：`block_on` 得到另一线程写入的值。
#[test]
fn pending_flow_is_delivered_as_stage() {
    let dispatcher = dispatcher();
    let delayed = DelayedFlow::<Value>::create();
    let handle = delayed.clone();
    let mut call = stage_invocation(move || Ok(Some(Box::new(handle.flow()))));

    let stage = into_stage(dispatcher.intercept(&mut call).expect("分派应成功"));
    let completer = thread::spawn(move || {
        delayed
            .complete(Box::new(99_i32))
            .expect("首次完成应成功");
    });

    let value = block_on(stage).expect("不应失败").expect("应有值");
    completer.join().expect("完成线程不应 panic");
    assert_eq!(value.downcast_ref::<i32>(), Some(&99));
}

/// ## 测试六：转换服务兜底第三方 Future 类型
#[test]
fn registered_converter_produces_declared_future() {
    let mut conversion = DefaultConversionService::new();
    conversion.register(Deferred);
    let dispatcher = dispatcher_with(conversion);
    let mut call = MethodInvocation::builder("load")
        .returns(ReturnType::future::<Deferred>(ReturnType::of::<i32>()))
        .target(|_| Ok(Some(Box::new(Stage::ready(Ok(Some(Box::new(3_i32))))))))
        .build()
        .expect("构建应成功");

    let delivered = dispatcher
        .intercept(&mut call)
        .expect("已注册的转换应成功")
        .expect("应交付值");
    let Deferred(stage) = *delivered
        .downcast::<Deferred>()
        .expect("交付形态应为 Deferred");
    let value = block_on(stage).expect("不应失败").expect("应有值");
    assert_eq!(value.downcast_ref::<i32>(), Some(&3));
}

/// ## 测试七：无可用转换时报告转换错误
#[test]
fn missing_converter_is_conversion_error() {
    let dispatcher = dispatcher();
    let mut call = MethodInvocation::builder("load")
        .returns(ReturnType::future::<Deferred>(ReturnType::of::<i32>()))
        .target(|_| Ok(Some(Box::new(Stage::ready(Ok(None))))))
        .build()
        .expect("构建应成功");

    let error = dispatcher
        .intercept(&mut call)
        .expect_err("没有转换器时必须失败");
    assert_eq!(error.code(), codes::CONVERSION);
    assert!(error.to_string().contains("`load`"));
}

/// ## 测试八：`intercept_result_as_flow` 直接取得执行流
#[test]
fn typed_flow_accessor_bridges_stage() {
    let dispatcher = dispatcher();
    let mut call = stage_invocation(|| Ok(Some(Box::new(Stage::ready(Ok(Some(Box::new(8_i32))))))));
    let mut method = dispatcher.classify(&mut call);
    let flow = method.intercept_result_as_flow().expect("应得到执行流");
    let value = flow
        .into_resolved()
        .ok()
        .and_then(|resolved| resolved.value())
        .expect("应已完成");
    assert_eq!(value.downcast_ref::<i32>(), Some(&8));
}
