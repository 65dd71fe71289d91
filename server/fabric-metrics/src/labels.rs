use std::borrow::Cow;

/// A label value that is safe to export (bounded cardinality).
#[derive(Clone, Debug)]
pub struct BoundedLabel(Cow<'static, str>);

impl BoundedLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct LabelPolicy {
    /// Maximum distinct pacer-flow buckets exported. A `(source, target)`
    /// flow key is unbounded in principle (any endpoint can talk to any
    /// other); bucket it down before handing it to Prometheus as a label.
    pub max_flow_buckets: usize,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self { max_flow_buckets: 64 }
    }
}

impl LabelPolicy {
    /// Bucket a `(source, target)` flow into a bounded label using an
    /// FNV-1a hash of the pair's wire bytes.
    pub fn flow_bucket(&self, source: &fabric_wire::EndpointId, target: &fabric_wire::EndpointId) -> BoundedLabel {
        let mut hash: u32 = 0x811c9dc5;
        for byte in source.raw().iter().chain(target.raw().iter()) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let bucket = (hash as usize) % self.max_flow_buckets.max(1);
        BoundedLabel(Cow::Owned(format!("flow{:02}", bucket)))
    }

    pub fn reason(reason: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(reason))
    }

    pub fn kind(kind: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_wire::EndpointId;

    #[test]
    fn flow_bucket_is_stable_for_same_pair() {
        let policy = LabelPolicy::default();
        let a = EndpointId::new("DSH").unwrap();
        let b = EndpointId::new("001").unwrap();
        assert_eq!(policy.flow_bucket(&a, &b).as_str(), policy.flow_bucket(&a, &b).as_str());
    }

    #[test]
    fn flow_bucket_is_bounded_in_cardinality() {
        let policy = LabelPolicy { max_flow_buckets: 4 };
        let a = EndpointId::new("DSH").unwrap();
        for n in 0..20 {
            let b = EndpointId::new(&format!("{n:03}")).unwrap();
            let bucket = policy.flow_bucket(&a, &b);
            assert!(bucket.as_str().starts_with("flow"));
        }
    }
}
