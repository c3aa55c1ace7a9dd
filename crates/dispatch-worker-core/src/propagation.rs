//! Forwarding of selected HTTP request headers across gRPC hops.
//!
//! A [`ForwardedHeaders`] map travels in two reserved metadata keys,
//! [`FORWARDED_NAMES_KEY`] and [`FORWARDED_CONTENTS_KEY`], appended pairwise
//! so the n-th name matches the n-th value. Downstream services rebuild the
//! map with [`server_interceptor`] and may attribute logs to it.
//!
//! On the client side, [`ForwardingInterceptor`] re-emits whatever map is in
//! scope for the current task (see [`ForwardedHeaders::scope`]), unless the
//! outgoing request already carries forwarded headers.

use core::{fmt, future::Future};
use std::collections::BTreeMap;
use tonic::{
    Request, Status,
    metadata::{AsciiMetadataValue, MetadataMap},
    service::Interceptor,
};

/// Metadata key carrying forwarded header names.
pub const FORWARDED_NAMES_KEY: &str = "httpheaderforwardingnames";

/// Metadata key carrying forwarded header values, in the same order as
/// [`FORWARDED_NAMES_KEY`].
pub const FORWARDED_CONTENTS_KEY: &str = "httpheaderforwardingcontents";

tokio::task_local! {
    static CURRENT: ForwardedHeaders;
}

/// Header name to value map forwarded alongside a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardedHeaders(BTreeMap<String, String>);

impl ForwardedHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Rebuilds the map from incoming metadata.
    ///
    /// Returns `None` when nothing was forwarded, or when the name and value
    /// lists differ in length and cannot be paired up.
    pub fn from_metadata(metadata: &MetadataMap) -> Option<Self> {
        let names = ascii_values(metadata, FORWARDED_NAMES_KEY);
        let contents = ascii_values(metadata, FORWARDED_CONTENTS_KEY);

        if names.is_empty() || names.len() != contents.len() {
            return None;
        }

        Some(names.into_iter().zip(contents).collect())
    }

    /// Appends the map to outgoing metadata.
    ///
    /// Leaves `metadata` untouched if either reserved key is already present,
    /// so headers forwarded by an upstream hop win. Pairs that are not valid
    /// ASCII metadata are skipped.
    pub fn inject(&self, metadata: &mut MetadataMap) {
        if metadata.contains_key(FORWARDED_NAMES_KEY)
            || metadata.contains_key(FORWARDED_CONTENTS_KEY)
        {
            return;
        }

        for (name, value) in &self.0 {
            match (
                AsciiMetadataValue::try_from(name.as_str()),
                AsciiMetadataValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    metadata.append(FORWARDED_NAMES_KEY, name);
                    metadata.append(FORWARDED_CONTENTS_KEY, value);
                }
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Skipping non-ASCII forwarded header {name}");
                }
            }
        }
    }

    /// Runs `fut` with this map as the current task's forwarded headers.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }

    /// The map in scope for the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// The map attached by [`server_interceptor`], if any.
    pub fn from_request<T>(request: &Request<T>) -> Option<&Self> {
        request.extensions().get::<Self>()
    }
}

impl FromIterator<(String, String)> for ForwardedHeaders {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ForwardedHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

fn ascii_values(metadata: &MetadataMap, key: &str) -> Vec<String> {
    metadata
        .get_all(key)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_owned)
        .collect()
}

/// Server interceptor that attaches forwarded headers to the request
/// extensions, where handlers can read them with
/// [`ForwardedHeaders::from_request`].
#[allow(clippy::result_large_err)]
pub fn server_interceptor(mut request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(headers) = ForwardedHeaders::from_metadata(request.metadata()) {
        request.extensions_mut().insert(headers);
    }
    Ok(request)
}

/// Client interceptor that forwards the headers in scope for the current task.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardingInterceptor;

impl Interceptor for ForwardingInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(headers) = ForwardedHeaders::current() {
            headers.inject(request.metadata_mut());
        }
        Ok(request)
    }
}
