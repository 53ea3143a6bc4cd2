//! Benchmarks for the Routing Evaluator with varying stage-table sizes and
//! policy resolution against a large snapshot.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strand_cost_guard::policy::{DowngradeTrigger, MatchPattern, PolicySnapshot, RoutingPolicy, StageConfig};
use strand_cost_guard::pricing::PricingTable;
use strand_cost_guard::routing::RoutingEvaluator;
use strand_cost_guard::types::{RoutingSignals, Scope};

fn policy_with_stages(count: usize) -> RoutingPolicy {
    let stages = (0..count)
        .map(|i| StageConfig {
            stage: format!("stage-{i}"),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: Some(2048),
            temperature: None,
            trigger: DowngradeTrigger { soft_threshold_exceeded: true, ..Default::default() },
        })
        .collect();
    RoutingPolicy {
        id: "bench-policy".to_string(),
        scope: Scope::Global,
        tenant_pattern: MatchPattern::Any,
        strand_pattern: MatchPattern::Any,
        workflow_pattern: MatchPattern::Any,
        default_model: "gpt-4o".to_string(),
        default_fallback_model: Some("gpt-4o-mini".to_string()),
        stages,
    }
}

/// `RoutingPolicy::stage` does a linear scan; latency should grow with the
/// number of configured stages.
fn bench_evaluate_by_stage_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_evaluate");
    let signals = RoutingSignals { soft_threshold_exceeded: true, remaining_budget: Some(10.0), iteration_count: 3, avg_latency_ms: Some(200.0) };

    for count in [1, 10, 50, 200] {
        let policy = policy_with_stages(count);
        let target_stage = format!("stage-{}", count - 1);

        group.bench_with_input(BenchmarkId::new("stages", count), &count, |b, _| {
            b.iter(|| {
                black_box(RoutingEvaluator::evaluate(&policy, &target_stage, &signals));
            });
        });
    }

    group.finish();
}

/// `PolicySnapshot::resolve_routing` scores every configured policy and
/// picks the highest — latency should grow with the number of policies.
fn bench_resolve_routing_by_policy_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_routing");

    for count in [1, 10, 50, 200] {
        let routing = (0..count)
            .map(|i| RoutingPolicy {
                id: format!("policy-{i}"),
                scope: Scope::Tenant,
                tenant_pattern: MatchPattern::Exact(format!("tenant-{i}")),
                strand_pattern: MatchPattern::Any,
                workflow_pattern: MatchPattern::Any,
                default_model: "gpt-4o".to_string(),
                default_fallback_model: None,
                stages: Vec::new(),
            })
            .collect();
        let snapshot = PolicySnapshot { budgets: Vec::new(), routing, pricing: PricingTable::new(), loaded_at: chrono::Utc::now() };
        let target_tenant = format!("tenant-{}", count - 1);

        group.bench_with_input(BenchmarkId::new("policies", count), &count, |b, _| {
            b.iter(|| {
                black_box(snapshot.resolve_routing(&target_tenant, "any-strand", "any-workflow"));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_evaluate_by_stage_count, bench_resolve_routing_by_policy_count);
criterion_main!(benches);
