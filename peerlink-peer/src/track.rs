//! Mid-call replacement of the outgoing media source

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handle::PeerConnectionHandle;
use crate::media::{LocalTrack, MediaKind, MediaSource};

/// A completed change to the senders, kept so it can be undone
#[derive(Debug)]
enum Step {
    Replaced { previous: LocalTrack },
    Added { kind: MediaKind },
    Removed { previous: LocalTrack },
}

/// Outcome of a successful replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replacement {
    /// The set of negotiated lines changed; an offer is needed
    pub renegotiate: bool,
}

/// Move the senders of `handle` from `current` to `next`.
///
/// Kinds present in both sources are swapped in place where the handle
/// supports it. Added or removed kinds, and kinds that cannot be replaced in
/// place, change the negotiated lines and ask for renegotiation. If any step
/// fails, the completed steps are undone and `current` stays attached.
pub async fn replace_source(
    handle: &dyn PeerConnectionHandle,
    current: &MediaSource,
    next: &MediaSource,
) -> Result<Replacement> {
    let mut done: Vec<Step> = Vec::new();
    let mut renegotiate = false;

    let kinds = current.kinds().union(&next.kinds()).copied().collect::<Vec<_>>();
    for kind in kinds {
        let result = match (current.track(kind), next.track(kind)) {
            (Some(old), Some(new)) if old == new => Ok(()),
            (Some(old), Some(new)) if handle.supports_replace(kind) => {
                debug!(kind = %kind, from = %old.label, to = %new.label, "Replacing track in place");
                handle.replace_track(new).await.map(|()| {
                    done.push(Step::Replaced {
                        previous: old.clone(),
                    });
                })
            }
            (Some(old), Some(new)) => {
                debug!(kind = %kind, "In-place replacement unsupported, re-adding track");
                renegotiate = true;
                match handle.remove_track(kind).await {
                    Ok(()) => {
                        done.push(Step::Removed {
                            previous: old.clone(),
                        });
                        handle
                            .add_track(new)
                            .await
                            .map(|()| done.push(Step::Added { kind }))
                    }
                    Err(e) => Err(e),
                }
            }
            (None, Some(new)) => {
                renegotiate = true;
                handle
                    .add_track(new)
                    .await
                    .map(|()| done.push(Step::Added { kind }))
            }
            (Some(old), None) => {
                renegotiate = true;
                handle.remove_track(kind).await.map(|()| {
                    done.push(Step::Removed {
                        previous: old.clone(),
                    });
                })
            }
            (None, None) => Ok(()),
        };

        if let Err(e) = result {
            warn!(kind = %kind, error = %e, "Track replacement failed, restoring previous source");
            undo(handle, done).await;
            return Err(Error::Track(format!("{kind}: {e}")));
        }
    }

    info!(renegotiate, "Local media source replaced");
    Ok(Replacement { renegotiate })
}

async fn undo(handle: &dyn PeerConnectionHandle, done: Vec<Step>) {
    for step in done.into_iter().rev() {
        let result = match &step {
            Step::Replaced { previous } => handle.replace_track(previous).await,
            Step::Added { kind } => handle.remove_track(*kind).await,
            Step::Removed { previous } => handle.add_track(previous).await,
        };
        if let Err(e) = result {
            warn!(step = ?step, error = %e, "Failed to undo track change");
        }
    }
}
