//! Mirrors objects of foreign monitoring kinds into the native kinds
//!
//! One loop runs per enabled [`ConversionPair`]. Each foreign object is translated
//! into a native object with the same name and namespace; the native object is only
//! written when its content would change.
use crate::{
    cluster::{self, ClusterExt, ListParams, SharedCluster, WatchScope},
    config::ConverterConfig,
    utils::{retry_backoff, ResettableBackoffWrapper, StreamBackoff},
    watcher::{self, watcher},
};
use futures::{future, StreamExt};
use parking_lot::Mutex;
use std::{collections::HashSet, time::Duration};
use thiserror::Error;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use vmop_core::{DynamicObject, ResourceKey};

mod translate;
mod watermark;

pub use translate::{
    same_content, source_ref, translate, ConversionPair, TranslateError, TranslateOptions,
    CONVERTED_FROM_ANNOTATION, IGNORE_UPDATES_ANNOTATION,
};
pub use watermark::{digest, Watermark, Watermarks};

/// Errors converting a single foreign object
#[derive(Debug, Error)]
pub enum Error {
    /// The foreign object cannot be translated
    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// The native object could not be read
    #[error("cannot read {key}: {source}")]
    Read {
        /// The native object
        key: ResourceKey,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },

    /// The native object could not be written
    #[error("cannot write {key}: {source}")]
    Write {
        /// The native object
        key: ResourceKey,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },
}

/// What converting a foreign object did to its mirror
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    /// The mirror did not exist and was created
    Created,
    /// The mirror was replaced with new content
    Updated,
    /// The mirror already had the translated content
    Unchanged,
    /// The mirror opted out of conversion updates
    Ignored,
}

/// Runs the conversion loops
pub struct Converter {
    cluster: SharedCluster,
    scope: WatchScope,
    pairs: Vec<ConversionPair>,
    options: TranslateOptions,
    resync_period: Duration,
    watermarks: Mutex<Watermarks>,
}

impl Converter {
    /// A converter for every builtin pair not disabled by `config`
    pub fn new(cluster: SharedCluster, scope: WatchScope, config: &ConverterConfig) -> Self {
        let pairs = ConversionPair::builtin()
            .into_iter()
            .filter(|pair| {
                !config
                    .disabled_kinds
                    .iter()
                    .any(|kind| kind.eq_ignore_ascii_case(&pair.foreign.kind))
            })
            .collect();
        Self {
            cluster,
            scope,
            pairs,
            options: TranslateOptions {
                filter_prefixes: config.filter_prefixes.clone(),
                owner_references: config.owner_references,
            },
            resync_period: config.resync_period,
            watermarks: Mutex::default(),
        }
    }

    /// The enabled pairs
    pub fn pairs(&self) -> &[ConversionPair] {
        &self.pairs
    }

    /// Bring the mirror of `foreign` up to date
    pub async fn convert(&self, pair: &ConversionPair, foreign: &DynamicObject) -> Result<Conversion, Error> {
        let foreign_key = foreign.key(&pair.foreign);
        let desired = translate(pair, foreign, &self.options)?;
        let digest = digest(&desired);
        let native_key = desired.key(&pair.native);
        let existing = self
            .cluster
            .get_opt(&native_key)
            .await
            .map_err(|source| Error::Read {
                key: native_key.clone(),
                source,
            })?;
        if self.watermarks.lock().is_current(&foreign_key, digest, existing.as_ref()) {
            return Ok(Conversion::Unchanged);
        }

        let write_failed = |source| Error::Write {
            key: native_key.clone(),
            source,
        };
        let (outcome, mirror) = match existing {
            None => {
                let created = self
                    .cluster
                    .create(&pair.native, desired)
                    .await
                    .map_err(write_failed)?;
                (Conversion::Created, created)
            }
            Some(existing) if existing.annotation(IGNORE_UPDATES_ANNOTATION) == Some("enabled") => {
                return Ok(Conversion::Ignored);
            }
            Some(existing) if same_content(&existing, &desired) => (Conversion::Unchanged, existing),
            Some(mut existing) => {
                merge_owned(&mut existing, desired);
                let replaced = self
                    .cluster
                    .replace(&pair.native, existing)
                    .await
                    .map_err(write_failed)?;
                (Conversion::Updated, replaced)
            }
        };
        self.watermarks.lock().record(foreign_key, digest, &mirror);
        Ok(outcome)
    }

    /// Delete the mirror of a deleted foreign object, returning whether one was deleted
    ///
    /// Native objects that were not converted from `foreign` are left alone.
    pub async fn remove_mirror(&self, pair: &ConversionPair, foreign: &DynamicObject) -> Result<bool, Error> {
        self.watermarks.lock().forget(&foreign.key(&pair.foreign));
        let native_key = mirror_key(pair, foreign);
        let native = self
            .cluster
            .get_opt(&native_key)
            .await
            .map_err(|source| Error::Read {
                key: native_key.clone(),
                source,
            })?;
        let converted_from_foreign = native.is_some_and(|native| {
            native.annotation(CONVERTED_FROM_ANNOTATION) == Some(source_ref(&pair.foreign, foreign).as_str())
        });
        if !converted_from_foreign {
            return Ok(false);
        }
        match self.cluster.delete(&native_key).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(source) => Err(Error::Write {
                key: native_key,
                source,
            }),
        }
    }

    /// Convert every foreign object of `pair` until `shutdown` is cancelled
    ///
    /// Returns early if the cluster does not serve the foreign kind.
    pub async fn run_pair(&self, pair: &ConversionPair, shutdown: CancellationToken) {
        let events = StreamBackoff::new(
            watcher(self.cluster.clone(), pair.foreign.clone(), self.scope.clone()),
            ResettableBackoffWrapper::new(retry_backoff()),
        );
        futures::pin_mut!(events);
        let mut resync = (!self.resync_period.is_zero())
            .then(|| tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period));
        info!(foreign = %pair.foreign, native = %pair.native, "starting conversion");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply_event(pair, event).await,
                    Some(Err(err)) if is_not_served(&err) => {
                        warn!(kind = %pair.foreign, "kind is not served by the cluster, conversion disabled");
                        break;
                    }
                    Some(Err(err)) => warn!(kind = %pair.foreign, error = %err, "watch failed, backing off"),
                    None => break,
                },
                () = tick(&mut resync) => self.resync(pair).await,
            }
        }
        debug!(kind = %pair.foreign, "conversion stopped");
    }

    async fn apply_event(&self, pair: &ConversionPair, event: watcher::Event) {
        match event {
            watcher::Event::Applied(foreign) => self.convert_logged(pair, &foreign).await,
            watcher::Event::Deleted(foreign) => self.remove_logged(pair, &foreign).await,
            watcher::Event::Restarted(objects) => {
                let live = objects
                    .iter()
                    .map(|foreign| foreign.key(&pair.foreign))
                    .collect::<HashSet<_>>();
                let gone = self
                    .watermarks
                    .lock()
                    .keys()
                    .filter(|key| key.kind == pair.foreign && !live.contains(*key))
                    .cloned()
                    .collect::<Vec<_>>();
                for foreign in &objects {
                    self.convert_logged(pair, foreign).await;
                }
                for key in gone {
                    let mut foreign = DynamicObject::new(&key.name, &pair.foreign);
                    foreign.metadata.namespace = key.namespace.clone();
                    self.remove_logged(pair, &foreign).await;
                }
            }
        }
    }

    async fn resync(&self, pair: &ConversionPair) {
        match self
            .cluster
            .list_in_scope(&pair.foreign, &self.scope, &ListParams::default())
            .await
        {
            Ok(objects) => {
                debug!(kind = %pair.foreign, objects = objects.len(), "resync");
                for foreign in &objects {
                    self.convert_logged(pair, foreign).await;
                }
            }
            Err(err) => warn!(kind = %pair.foreign, error = %err, "resync list failed"),
        }
    }

    async fn convert_logged(&self, pair: &ConversionPair, foreign: &DynamicObject) {
        let span = info_span!(
            "convert",
            kind = %pair.foreign.kind,
            namespace = %foreign.namespace_any(),
            name = %foreign.name_any(),
        );
        async {
            match self.convert(pair, foreign).await {
                Ok(Conversion::Created) => info!(native = %pair.native.kind, "created converted object"),
                Ok(Conversion::Updated) => info!(native = %pair.native.kind, "updated converted object"),
                Ok(Conversion::Ignored) => debug!("native object ignores conversion updates"),
                Ok(Conversion::Unchanged) => trace!("converted object is up to date"),
                Err(err) => warn!(error = %err, "cannot convert object"),
            }
        }
        .instrument(span)
        .await
    }

    async fn remove_logged(&self, pair: &ConversionPair, foreign: &DynamicObject) {
        match self.remove_mirror(pair, foreign).await {
            Ok(true) => info!(
                kind = %pair.native.kind,
                namespace = %foreign.namespace_any(),
                name = %foreign.name_any(),
                "deleted converted object"
            ),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "cannot delete converted object"),
        }
    }
}

/// Write everything the converter owns from `desired` into `existing`
///
/// Labels and annotations added to the mirror by others are kept.
fn merge_owned(existing: &mut DynamicObject, desired: DynamicObject) {
    let meta = &mut existing.metadata;
    if let Some(labels) = desired.metadata.labels {
        meta.labels.get_or_insert_with(Default::default).extend(labels);
    }
    if let Some(annotations) = desired.metadata.annotations {
        meta.annotations.get_or_insert_with(Default::default).extend(annotations);
    }
    meta.owner_references = desired.metadata.owner_references;
    match (&mut existing.data, desired.data) {
        (serde_json::Value::Object(data), serde_json::Value::Object(mut desired)) => {
            if let Some(spec) = desired.remove("spec") {
                data.insert("spec".into(), spec);
            }
        }
        (data, desired) => *data = desired,
    }
}

fn mirror_key(pair: &ConversionPair, foreign: &DynamicObject) -> ResourceKey {
    let key = ResourceKey::new(pair.native.clone(), foreign.name_any());
    match &foreign.metadata.namespace {
        Some(namespace) => key.within(namespace),
        None => key,
    }
}

fn is_not_served(err: &watcher::Error) -> bool {
    matches!(
        err,
        watcher::Error::WatchStartFailed(cluster::Error::KindNotServed(_))
            | watcher::Error::InitialListFailed(cluster::Error::KindNotServed(_))
    )
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
