use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spark_flow::{DelayedFlow, Flow};

/// 长同步链的构建与驱动开销。
///
/// # 设计目的（Why）
/// - 即时流每一步只是一次闭包调用；延迟流每一步多出一次 Step 分配、一次类型擦除与一次原子交接；
/// - 两者对比可以直观看到“结果已知”时走即时路径的收益。
///
/// # 执行逻辑（How）
/// - `imperative`：在 `Flow::just` 上串联 `len` 次 `map`；
/// - `delayed`：先在 `DelayedFlow` 上串联 `len` 次 `map`，再完成它，驱动循环一次性跑完整条链。
fn bench_map_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_chain");
    for len in [8_usize, 64, 512] {
        group.bench_with_input(BenchmarkId::new("imperative", len), &len, |b, &len| {
            b.iter(|| {
                let mut flow = Flow::just(0_u64);
                for _ in 0..len {
                    flow = flow.map(|value| value.map(|v| v + 1));
                }
                flow.try_complete_value()
            })
        });
        group.bench_with_input(BenchmarkId::new("delayed", len), &len, |b, &len| {
            b.iter(|| {
                let delayed = DelayedFlow::create();
                let mut flow = delayed.flow();
                for _ in 0..len {
                    flow = flow.map(|value: Option<u64>| value.map(|v| v + 1));
                }
                let _ = delayed.complete(0_u64);
                flow.try_complete_value()
            })
        });
    }
    group.finish();
}

criterion_group!(flow_benches, bench_map_chain);
criterion_main!(flow_benches);
