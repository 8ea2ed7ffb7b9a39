use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, OnceLock},
};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

#[derive(Default)]
struct MetricsState {
    // HTTP 请求
    requests_total: u64,
    request_errors: u64,
    per_endpoint: HashMap<&'static str, u64>,
    per_endpoint_err: HashMap<&'static str, u64>,
    // 地址分配
    allocations_total: u64,
    allocation_failures: u64,
    // 链查询成功/失败/超时与时延统计（毫秒）
    chain_query_ok: u64,
    chain_query_err: u64,
    chain_query_timeout: u64,
    chain_query_latency_sum_ms: u128,
    // 简易直方图分桶（毫秒）：<50, <100, <250, <500, <1000, >=1000
    chain_query_hist_buckets: [u64; 6],
    // 事件处理
    events_by_outcome: HashMap<&'static str, u64>,
    unknown_address_events: u64,
    terminal_by_state: HashMap<&'static str, u64>,
    webhook_rejected: u64,
    poll_cycles: u64,
}

fn state() -> MutexGuard<'static, MetricsState> {
    let m = METRICS.get_or_init(|| Mutex::new(MetricsState::default()));
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(), // 避免因锁污染导致 panic
    }
}

pub fn count_ok(endpoint: &'static str) {
    let mut s = state();
    s.requests_total += 1;
    *s.per_endpoint.entry(endpoint).or_insert(0) += 1;
}

pub fn count_err(endpoint: &'static str) {
    let mut s = state();
    s.requests_total += 1;
    s.request_errors += 1;
    *s.per_endpoint.entry(endpoint).or_insert(0) += 1;
    *s.per_endpoint_err.entry(endpoint).or_insert(0) += 1;
}

pub fn inc_allocation(ok: bool) {
    let mut s = state();
    if ok {
        s.allocations_total += 1;
    } else {
        s.allocation_failures += 1;
    }
}

pub fn observe_chain_query_ms(latency_ms: u128, ok: bool) {
    let mut s = state();
    if ok {
        s.chain_query_ok += 1;
    } else {
        s.chain_query_err += 1;
    }
    s.chain_query_latency_sum_ms += latency_ms;
    let b = if latency_ms < 50 {
        0
    } else if latency_ms < 100 {
        1
    } else if latency_ms < 250 {
        2
    } else if latency_ms < 500 {
        3
    } else if latency_ms < 1000 {
        4
    } else {
        5
    };
    s.chain_query_hist_buckets[b] += 1;
}

pub fn inc_chain_query_timeout() {
    state().chain_query_timeout += 1;
}

pub fn inc_event(outcome: &'static str) {
    *state().events_by_outcome.entry(outcome).or_insert(0) += 1;
}

pub fn inc_unknown_address() {
    state().unknown_address_events += 1;
}

pub fn inc_terminal(payment_state: &'static str) {
    *state().terminal_by_state.entry(payment_state).or_insert(0) += 1;
}

pub fn inc_webhook_rejected() {
    state().webhook_rejected += 1;
}

pub fn inc_poll_cycle() {
    state().poll_cycles += 1;
}

fn push_counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} counter\n", name));
    out.push_str(&format!("{} {}\n", name, value));
}

fn push_labeled(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: &HashMap<&'static str, u64>,
) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} counter\n", name));
    let mut entries: Vec<_> = values.iter().collect();
    entries.sort();
    for (k, v) in entries {
        out.push_str(&format!("{}{{{}=\"{}\"}} {}\n", name, label, k, v));
    }
}

pub fn render_prometheus() -> String {
    let s = state();
    let mut out = String::new();

    push_counter(&mut out, "ironpay_requests_total", "Total requests", s.requests_total);
    push_counter(
        &mut out,
        "ironpay_errors_total",
        "Total error responses",
        s.request_errors,
    );
    push_labeled(
        &mut out,
        "ironpay_endpoint_requests_total",
        "Requests per endpoint",
        "endpoint",
        &s.per_endpoint,
    );
    push_labeled(
        &mut out,
        "ironpay_endpoint_errors_total",
        "Errors per endpoint",
        "endpoint",
        &s.per_endpoint_err,
    );

    push_counter(
        &mut out,
        "ironpay_allocations_total",
        "Receiving addresses allocated",
        s.allocations_total,
    );
    push_counter(
        &mut out,
        "ironpay_allocation_failures_total",
        "Failed address allocations",
        s.allocation_failures,
    );

    // 链查询统计
    out.push_str("# HELP ironpay_chain_queries_total Chain source queries\n");
    out.push_str("# TYPE ironpay_chain_queries_total counter\n");
    out.push_str(&format!(
        "ironpay_chain_queries_total{{result=\"ok\"}} {}\n",
        s.chain_query_ok
    ));
    out.push_str(&format!(
        "ironpay_chain_queries_total{{result=\"err\"}} {}\n",
        s.chain_query_err
    ));
    out.push_str(&format!(
        "ironpay_chain_queries_total{{result=\"timeout\"}} {}\n",
        s.chain_query_timeout
    ));

    push_counter(
        &mut out,
        "ironpay_chain_query_latency_ms_sum",
        "Sum of chain query latency in ms",
        s.chain_query_latency_sum_ms,
    );

    out.push_str("# HELP ironpay_chain_query_latency_ms_bucket Chain query latency histogram buckets\n");
    out.push_str("# TYPE ironpay_chain_query_latency_ms_bucket histogram\n");
    let bounds = [50, 100, 250, 500, 1000];
    let mut cumulative = 0u64;
    for (i, bound) in bounds.iter().enumerate() {
        cumulative += s.chain_query_hist_buckets[i];
        out.push_str(&format!(
            "ironpay_chain_query_latency_ms_bucket{{le=\"{}\"}} {}\n",
            bound, cumulative
        ));
    }
    // +Inf 桶
    out.push_str(&format!(
        "ironpay_chain_query_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
        s.chain_query_hist_buckets.iter().sum::<u64>()
    ));

    push_labeled(
        &mut out,
        "ironpay_chain_events_total",
        "Chain events by outcome",
        "outcome",
        &s.events_by_outcome,
    );
    push_counter(
        &mut out,
        "ironpay_unknown_address_events_total",
        "Chain events dropped for unknown addresses",
        s.unknown_address_events,
    );
    push_labeled(
        &mut out,
        "ironpay_terminal_payments_total",
        "Payments that reached a terminal state",
        "state",
        &s.terminal_by_state,
    );
    push_counter(
        &mut out,
        "ironpay_webhook_rejected_total",
        "Rejected webhook deliveries",
        s.webhook_rejected,
    );
    push_counter(
        &mut out,
        "ironpay_poll_cycles_total",
        "Completed polling cycles",
        s.poll_cycles,
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        inc_event("applied");
        inc_terminal("confirmed");
        observe_chain_query_ms(120, true);

        let text = render_prometheus();
        assert!(text.contains("ironpay_chain_events_total{outcome=\"applied\"}"));
        assert!(text.contains("ironpay_terminal_payments_total{state=\"confirmed\"}"));
        assert!(text.contains("ironpay_chain_query_latency_ms_bucket{le=\"+Inf\"}"));
    }
}
