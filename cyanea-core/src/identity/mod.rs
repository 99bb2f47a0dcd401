//! Recovering canonical event ids from external mediums.
//!
//! Most external systems have no field for an opaque sync id, so a sink
//! embeds the id into whatever it writes and recovers it when reading its
//! state back for diffing. Any scheme works as long as it obeys the
//! round-trip law `extract(embed(id, aux)) == Some((id, aux))` and returns
//! `None` for items it never produced.

mod tags;

use std::collections::{BTreeMap, HashSet};

use crate::error::{CyaneaError, CyaneaResult};

pub use tags::{TagCodec, taghide, untaghide};

/// Auxiliary data stored alongside an id (e.g. a banner URL the medium
/// can't hold natively). Droppable when space runs out.
pub type Aux = BTreeMap<String, String>;

/// An id (plus auxiliary data) recovered from an external item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub id: String,
    pub aux: Aux,
}

/// A reversible scheme for hiding an id inside an external medium.
pub trait IdentityCodec {
    type Payload;

    fn embed(&self, id: &str, aux: &Aux) -> CyaneaResult<Self::Payload>;

    /// Never fails: foreign or corrupt items simply yield `None`.
    fn extract(&self, payload: &Self::Payload) -> Option<Recovered>;
}

/// An embedding that fit the medium, and whether auxiliary data had to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedded<P> {
    pub payload: P,
    pub dropped_aux: bool,
}

/// Embeds `id` and `aux`, falling back to the bare id if the full payload
/// doesn't satisfy `fits`.
pub fn embed_with_fallback<C: IdentityCodec>(
    codec: &C,
    id: &str,
    aux: &Aux,
    fits: impl Fn(&C::Payload) -> bool,
) -> CyaneaResult<Embedded<C::Payload>> {
    let payload = codec.embed(id, aux)?;
    if fits(&payload) {
        return Ok(Embedded {
            payload,
            dropped_aux: false,
        });
    }

    if !aux.is_empty() {
        let bare = codec.embed(id, &Aux::new())?;
        if fits(&bare) {
            return Ok(Embedded {
                payload: bare,
                dropped_aux: true,
            });
        }
    }

    Err(CyaneaError::IdentityEmbed {
        id: id.to_string(),
        reason: "the embedded id does not fit within the medium's size limit".to_string(),
    })
}

/// Recovers ids from every item that carries one, skipping foreign items.
///
/// Two items carrying the same id mean something else modified the medium;
/// that is an [`CyaneaError::IdentityConflict`] rather than a guess.
pub fn recover<'a, T>(
    items: &'a [T],
    extract: impl Fn(&T) -> Option<Recovered>,
) -> CyaneaResult<Vec<(Recovered, &'a T)>> {
    let mut seen = HashSet::new();
    let mut recovered = Vec::new();

    for item in items {
        let Some(found) = extract(item) else {
            continue;
        };
        if !seen.insert(found.id.clone()) {
            return Err(CyaneaError::IdentityConflict(found.id));
        }
        recovered.push((found, item));
    }

    Ok(recovered)
}
