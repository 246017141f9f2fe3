use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "requests",
    metric_type: MetricType::Counter,
    description: "Requests received. Tagged with kind (server/mobile/browser), env.",
};

pub const STREAM_CONNECTIONS: MetricDef = MetricDef {
    name: "stream.connections",
    metric_type: MetricType::Gauge,
    description: "Open SSE connections. Tagged with kind, env.",
};

pub const SUBSCRIBERS_DROPPED: MetricDef = MetricDef {
    name: "stream.subscribers_dropped",
    metric_type: MetricType::Counter,
    description: "Subscribers dropped because their queue overflowed. Tagged with stream.",
};

pub const EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "events.received",
    metric_type: MetricType::Counter,
    description: "Event payloads accepted from downstream SDKs. Tagged with endpoint.",
};

pub const EVENTS_DROPPED: MetricDef = MetricDef {
    name: "events.dropped",
    metric_type: MetricType::Counter,
    description: "Event payloads dropped (queue full, unparseable, or dispatcher disabled). Tagged with endpoint, reason.",
};

pub const EVENT_POSTS: MetricDef = MetricDef {
    name: "events.posts",
    metric_type: MetricType::Counter,
    description: "Batches POSTed upstream. Tagged with endpoint, status.",
};

pub const EVENT_POST_DURATION: MetricDef = MetricDef {
    name: "events.post_duration",
    metric_type: MetricType::Histogram,
    description: "Duration of upstream event POSTs in seconds. Tagged with endpoint.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    STREAM_CONNECTIONS,
    SUBSCRIBERS_DROPPED,
    EVENTS_RECEIVED,
    EVENTS_DROPPED,
    EVENT_POSTS,
    EVENT_POST_DURATION,
];
