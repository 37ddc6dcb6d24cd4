//! Admission trait for host pipelines.

use std::sync::Arc;

use super::limiter::Admission;
use super::object::ObjectInfo;
use super::registry::Registry;
use crate::error::Rejection;

/// Something that decides whether a request may proceed.
///
/// Pipelines hold an `Arc<dyn AdmissionControl>` so that tests can swap the
/// [`Registry`] for a stub.
pub trait AdmissionControl: Send + Sync {
    /// Check one request from `from` against `object`.
    fn check(&self, cid: &str, object: &ObjectInfo, from: &str) -> Result<Admission, Rejection>;
}

impl AdmissionControl for Registry {
    fn check(&self, cid: &str, object: &ObjectInfo, from: &str) -> Result<Admission, Rejection> {
        Registry::check(self, cid, object, from)
    }
}

impl<T: AdmissionControl + ?Sized> AdmissionControl for Arc<T> {
    fn check(&self, cid: &str, object: &ObjectInfo, from: &str) -> Result<Admission, Rejection> {
        (**self).check(cid, object, from)
    }
}
