//! Common types for metrics definitions.
//!
//! Each crate declares its metrics as `MetricDef` consts and aggregates them
//! into an `ALL_METRICS` slice, which the binary can render for operators.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Renders metric definitions as a markdown table for docs and the
/// `show-metrics` CLI command.
pub fn markdown_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_contains_every_metric() {
        let defs = [
            MetricDef {
                name: "requests",
                metric_type: MetricType::Counter,
                description: "Requests received",
            },
            MetricDef {
                name: "connections",
                metric_type: MetricType::Gauge,
                description: "Open stream connections",
            },
        ];

        let table = markdown_table(&defs);
        assert!(table.contains("`requests`"));
        assert!(table.contains("Gauge"));
        assert_eq!(table.lines().count(), 4);
    }
}
