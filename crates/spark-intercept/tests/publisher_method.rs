//! Publisher 策略：空值、失败、响应式类型互转与上下文传播。

use std::{sync::Arc, thread};

use futures::{StreamExt, executor::block_on, future, stream};
use spark_flow::{FlowError, InlineExecutor, PropagatedContext, codes as flow_codes};
use spark_intercept::{
    DefaultConversionService, Dispatcher, DispatcherConfig, InterceptedMethod, MethodInvocation,
    Publisher, ReturnType, Single, Value, codes,
};

fn dispatcher_with(config: DispatcherConfig) -> Dispatcher {
    Dispatcher::new(
        config,
        Arc::new(DefaultConversionService::new()),
        Arc::new(InlineExecutor),
    )
}

fn dispatcher() -> Dispatcher {
    dispatcher_with(DispatcherConfig::default())
}

fn publisher_invocation<F>(return_type: ReturnType, target: F) -> MethodInvocation
where
    F: Fn() -> Result<Option<Value>, FlowError> + Send + Sync + 'static,
{
    MethodInvocation::builder("stream")
        .returns(return_type)
        .target(move |_| target())
        .build()
        .expect("构建应成功")
}

fn collect(publisher: Publisher) -> Vec<Result<Value, FlowError>> {
    block_on(publisher.collect::<Vec<_>>())
}

/// 在流被轮询时读取环境上下文中的 `request-id`。
fn reads_request_id() -> Publisher {
    Publisher::new(stream::once(future::lazy(|_| {
        let seen = PropagatedContext::current()
            .get::<String>("request-id")
            .cloned();
        Ok(Box::new(seen) as Value)
    })))
}

/// ## 测试一：失败以恰好一个错误事件交付
///
/// - **意图 (Why)**：响应式调用方只通过流观察失败，失败既不能被吞掉，也不能重复发出；
/// - **契约 (What)**：订阅后得到一个事件，且是与原始失败相同的错误，没有任何值事件。
#[test]
fn exception_becomes_single_error_event() {
    let dispatcher = dispatcher();
    let original = FlowError::new(flow_codes::APPLICATION, "denied");
    let thrown = original.clone();
    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), move || Err(thrown.clone()));

    let delivered = dispatcher
        .intercept(&mut call)
        .expect("失败应以流交付")
        .expect("应交付流");
    let publisher = *delivered.downcast::<Publisher>().expect("交付形态应为 Publisher");

    let events = collect(publisher);
    assert_eq!(events.len(), 1, "应只有一个事件");
    match &events[0] {
        Err(error) => assert!(error.ptr_eq(&original)),
        Ok(_) => panic!("不应发出值事件"),
    }
}

/// ## 测试二：空值规整为空流
#[test]
fn null_result_becomes_empty_stream() {
    let dispatcher = dispatcher();
    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), || Ok(None));

    let delivered = dispatcher.intercept(&mut call).expect("分派应成功").expect("应交付流");
    let publisher = *delivered.downcast::<Publisher>().expect("交付形态应为 Publisher");
    assert!(collect(publisher).is_empty());
}

/// ## 测试三：链产出 `Publisher` 而方法声明 `Single`
#[test]
fn publisher_is_converted_to_declared_single() {
    let dispatcher = dispatcher();
    let mut call = publisher_invocation(ReturnType::of::<Single>(), || {
        Ok(Some(Box::new(Publisher::from_values(vec![
            Box::new(1_u8),
            Box::new(2_u8),
        ]))))
    });

    let delivered = dispatcher.intercept(&mut call).expect("转换应成功").expect("应交付值");
    let single = *delivered.downcast::<Single>().expect("交付形态应为 Single");
    let items = block_on(single.collect::<Vec<_>>());
    assert_eq!(items.len(), 1, "Single 至多一个元素");
    let first = items.into_iter().next().and_then(Result::ok).expect("应有首元素");
    assert_eq!(first.downcast_ref::<u8>(), Some(&1));
}

/// ## 测试四：订阅前的环境上下文在其他线程上的管道中可见
///
/// - **意图 (Why)**：请求级上下文在拦截前建立，流却可能在任意线程上被轮询；
/// - **逻辑 (How)**：在上下文作用域内分派，离开作用域后把流交给新线程轮询，流内读取环境上下文；
/// - **契约 (What)**：新线程上读到分派时的 `request-id`。
#[test]
fn ambient_context_travels_with_the_stream() {
    let dispatcher = dispatcher();
    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), || {
        Ok(Some(Box::new(reads_request_id())))
    });

    let delivered = {
        let context = PropagatedContext::new().put("request-id", String::from("req-7"));
        let _scope = context.enter();
        dispatcher.intercept(&mut call).expect("分派应成功").expect("应交付流")
    };
    let publisher = *delivered.downcast::<Publisher>().expect("交付形态应为 Publisher");

    let seen = thread::spawn(move || collect(publisher))
        .join()
        .expect("轮询线程不应 panic");
    let value = seen.into_iter().next().and_then(Result::ok).expect("应有一个元素");
    assert_eq!(
        value.downcast_ref::<Option<String>>(),
        Some(&Some(String::from("req-7")))
    );
}

/// ## 测试五：关闭传播后不附加上下文
#[test]
fn propagation_can_be_disabled() {
    let dispatcher = dispatcher_with(DispatcherConfig {
        context_propagation: false,
        ..DispatcherConfig::default()
    });
    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), || {
        Ok(Some(Box::new(reads_request_id())))
    });

    let context = PropagatedContext::new().put("request-id", String::from("req-8"));
    let _scope = context.enter();
    let mut method = dispatcher.classify(&mut call);
    match &method {
        InterceptedMethod::Publisher(publisher) => assert!(!publisher.propagates_context()),
        other => panic!("应为 Publisher 策略，实际 {other:?}"),
    }
    let publisher = method.intercept_result_as_publisher().expect("应得到流");
    assert!(publisher.context().is_none());
}

/// ## 测试六：链产出非响应式值是致命错误
#[test]
fn non_reactive_raw_result_is_illegal_state() {
    let dispatcher = dispatcher();
    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), || Ok(Some(Box::new(4_u64))));
    let error = dispatcher.intercept(&mut call).expect_err("形态不匹配必须立即报告");
    assert_eq!(error.code(), codes::ILLEGAL_STATE);
}

/// ## 测试七：声明 `Single` 时的失败同样只有一个错误事件
#[test]
fn single_exception_signals_one_error() {
    let dispatcher = dispatcher();
    let mut call = publisher_invocation(ReturnType::of::<Single>(), || {
        Err(FlowError::new(flow_codes::APPLICATION, "gone"))
    });
    let delivered = dispatcher.intercept(&mut call).expect("失败应以流交付").expect("应交付值");
    let single = *delivered.downcast::<Single>().expect("交付形态应为 Single");
    let events = block_on(single.collect::<Vec<_>>());
    assert_eq!(events.len(), 1);
    assert!(events[0].is_err());
}

/// ## 测试八：失败流同样携带拦截时的环境上下文
///
/// - **意图 (Why)**：成功、空值与失败三条路径交付的流应具备相同的上下文语义；
/// - **逻辑 (How)**：在上下文作用域内分派抛出失败的调用，分别声明 `Publisher` 与 `Single`；
/// - **契约 (What)**：两种交付形态的流都附带作用域内的 `request-id`。
#[test]
fn failure_stream_carries_ambient_context() {
    let dispatcher = dispatcher();
    let context = PropagatedContext::new().put("request-id", String::from("req-9"));
    let _scope = context.enter();
    let request_id = |context: Option<&PropagatedContext>| {
        context.and_then(|context| context.get::<String>("request-id").cloned())
    };

    let mut call = publisher_invocation(ReturnType::of::<Publisher>(), || {
        Err(FlowError::new(flow_codes::APPLICATION, "denied"))
    });
    let delivered = dispatcher.intercept(&mut call).expect("失败应以流交付").expect("应交付流");
    let publisher = *delivered.downcast::<Publisher>().expect("交付形态应为 Publisher");
    assert_eq!(request_id(publisher.context()).as_deref(), Some("req-9"));

    let mut call = publisher_invocation(ReturnType::of::<Single>(), || {
        Err(FlowError::new(flow_codes::APPLICATION, "denied"))
    });
    let delivered = dispatcher.intercept(&mut call).expect("失败应以流交付").expect("应交付值");
    let single = *delivered.downcast::<Single>().expect("交付形态应为 Single");
    assert_eq!(request_id(single.context()).as_deref(), Some("req-9"));
    let events = block_on(single.collect::<Vec<_>>());
    assert_eq!(events.len(), 1);
    assert!(events[0].is_err());
}
