//! Degraded responses for when neither cache nor network can answer.

use tracing::{debug, warn};

use crate::cache::{BucketHandle, BucketStore, RequestKey, Snapshot};
use crate::network::Destination;

const UNAVAILABLE_BODY: &str = "Service Unavailable";

pub struct OfflineFallback {
  static_bucket: BucketHandle,
  offline_page: RequestKey,
}

impl OfflineFallback {
  pub fn new(static_bucket: BucketHandle, offline_page: RequestKey) -> Self {
    Self {
      static_bucket,
      offline_page,
    }
  }

  /// Pick a degraded response for the request's content category. Never
  /// fails: a missing offline page degrades to a plain 503.
  pub fn resolve<S: BucketStore>(&self, store: &S, destination: Destination) -> Snapshot {
    match destination {
      Destination::Document => match store.lookup(&self.static_bucket, &self.offline_page) {
        Ok(Some(page)) => {
          debug!(key = %self.offline_page, "serving pre-cached offline page");
          page
        }
        Ok(None) => {
          warn!(key = %self.offline_page, "offline page is not cached");
          unavailable()
        }
        Err(e) => {
          warn!(error = %e, "failed to read offline page");
          unavailable()
        }
      },
      // An HTML page in an <img> slot renders as a broken image anyway
      Destination::Image => Snapshot::unavailable("image/svg+xml", Vec::new()),
      Destination::Other => unavailable(),
    }
  }
}

fn unavailable() -> Snapshot {
  Snapshot::unavailable("text/plain; charset=utf-8", UNAVAILABLE_BODY)
}
