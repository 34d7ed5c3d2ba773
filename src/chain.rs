/*
    diskfox
    https://github.com/dbalsom/diskfox

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/chain.rs

    Resolution of differencing-image ancestor chains. Given an opened
    top-level image, the resolver walks the parent hints recorded in each
    layer, verifies every located parent by unique id, and assembles the
    layers into a single content stream whose reads fall through to the
    deepest ancestor storing the data.
*/

use crate::{
    ownership::{Ownership, StreamRef},
    sparse::SparseStream,
    DiskError,
    Guid,
    SharedStream,
};

/// The host capability used to find and open parent image files. Paths are
/// the platform-dependent hint strings recorded in the child image; how
/// they map onto real storage is the host's business.
pub trait FileLocator {
    fn exists(&self, path: &str) -> bool;

    fn open(&self, path: &str, writable: bool) -> Result<SharedStream, DiskError>;

    /// Resolve a relative hint to an absolute path, for error messages.
    fn resolve_absolute(&self, path: &str) -> String;
}

/// One image file in a differencing chain.
pub trait ChainLayer {
    /// This image's 128-bit fingerprint.
    fn unique_id(&self) -> Guid;

    /// The fingerprint of the required parent image, or nil when the image
    /// is self-contained.
    fn parent_unique_id(&self) -> Guid;

    fn needs_parent(&self) -> bool {
        !self.parent_unique_id().is_nil()
    }

    /// Virtual capacity in bytes. Every layer of a chain shares the same
    /// capacity.
    fn capacity(&self) -> u64;

    /// The path this image was opened from, for error messages.
    fn full_path(&self) -> String;

    /// Candidate parent paths recorded in this image, in stored order.
    fn parent_location_hints(&self) -> Vec<String>;

    /// Open this layer's content as a sparse stream, stacked over `parent`
    /// when this layer is a differencing image.
    fn open_content(&mut self, parent: Option<StreamRef>) -> Result<Box<dyn SparseStream>, DiskError>;

    /// Release the layer's underlying file handle. Idempotent.
    fn close(&mut self);
}

struct ChainLink<L: ChainLayer> {
    layer: L,
    ownership: Ownership,
}

/// An ordered differencing chain: index 0 is the opened child, the last
/// element the self-contained root ancestor.
///
/// The chain owns exactly the layers tagged `Dispose`; those are closed,
/// deepest first, when the chain is dropped.
pub struct DiskChain<L: ChainLayer> {
    links: Vec<ChainLink<L>>,
}

impl<L: ChainLayer> std::fmt::Debug for DiskChain<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskChain").field("links", &self.links.len()).finish()
    }
}

impl<L: ChainLayer> DiskChain<L> {
    /// Resolve the full ancestor chain of `top`.
    ///
    /// For each layer still needing a parent, the layer's location hints
    /// are tried in order against `locator`; the first existing path is
    /// opened with `open_layer` and verified against the expected parent
    /// fingerprint. Every layer the resolver opens is owned by the chain.
    ///
    /// On any failure the layers opened so far are closed in reverse
    /// order, `top` included, and no handles remain open.
    pub fn resolve<F>(top: L, top_ownership: Ownership, locator: &dyn FileLocator, open_layer: F) -> Result<Self, DiskError>
    where
        F: Fn(&dyn FileLocator, &str) -> Result<L, DiskError>,
    {
        let mut links = vec![ChainLink {
            layer: top,
            ownership: top_ownership,
        }];

        let result = Self::resolve_parents(&mut links, locator, open_layer);
        match result {
            Ok(()) => Ok(DiskChain { links }),
            Err(e) => {
                release_links(&mut links);
                Err(e)
            }
        }
    }

    fn resolve_parents<F>(links: &mut Vec<ChainLink<L>>, locator: &dyn FileLocator, open_layer: F) -> Result<(), DiskError>
    where
        F: Fn(&dyn FileLocator, &str) -> Result<L, DiskError>,
    {
        loop {
            let cur = &links[links.len() - 1].layer;
            if !cur.needs_parent() {
                return Ok(());
            }

            let expected = cur.parent_unique_id();
            let child_path = cur.full_path();
            let hints = cur.parent_location_hints();
            log::debug!("resolving parent of {} from {} hint(s)", child_path, hints.len());

            let mut found = None;
            for hint in &hints {
                if !locator.exists(hint) {
                    continue;
                }
                let mut candidate = open_layer(locator, hint)?;
                if candidate.unique_id() != expected {
                    let found_id = candidate.unique_id();
                    let path = locator.resolve_absolute(hint);
                    candidate.close();
                    return Err(DiskError::ChainMismatch {
                        expected,
                        found: found_id,
                        path,
                    });
                }
                found = Some(candidate);
                break;
            }

            match found {
                Some(candidate) => {
                    links.push(ChainLink {
                        layer: candidate,
                        ownership: Ownership::Dispose,
                    });
                }
                None => {
                    return Err(DiskError::ParentNotFound {
                        child: child_path,
                        tried: hints,
                    });
                }
            }
        }
    }

    /// Build a chain from already-opened layers, child first. Verification
    /// is reduced to the fingerprint check between adjacent layers and the
    /// self-containment of the last. Layer ownership is per-edge, so a
    /// caller may hand the chain a parent it intends to keep.
    ///
    /// On failure every `Dispose`-tagged layer is closed in reverse order.
    pub fn from_layers(layers: Vec<(L, Ownership)>) -> Result<Self, DiskError> {
        let mut links: Vec<ChainLink<L>> = layers
            .into_iter()
            .map(|(layer, ownership)| ChainLink { layer, ownership })
            .collect();

        let result = Self::verify_links(&links);
        match result {
            Ok(()) => Ok(DiskChain { links }),
            Err(e) => {
                release_links(&mut links);
                Err(e)
            }
        }
    }

    fn verify_links(links: &[ChainLink<L>]) -> Result<(), DiskError> {
        if links.is_empty() {
            return Err(DiskError::Corrupt("a disk chain requires at least one layer".to_string()));
        }

        for pair in links.windows(2) {
            let expected = pair[0].layer.parent_unique_id();
            let found = pair[1].layer.unique_id();
            if !pair[0].layer.needs_parent() {
                return Err(DiskError::Corrupt(format!(
                    "self-contained image {} has layers stacked beneath it",
                    pair[0].layer.full_path()
                )));
            }
            if expected != found {
                return Err(DiskError::ChainMismatch {
                    expected,
                    found,
                    path: pair[1].layer.full_path(),
                });
            }
        }

        let last = &links[links.len() - 1].layer;
        if last.needs_parent() {
            return Err(DiskError::ParentNotFound {
                child: last.full_path(),
                tried: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.links.len()
    }

    /// Virtual capacity of the chain, as advertised by the opened child.
    pub fn capacity(&self) -> u64 {
        self.links[0].layer.capacity()
    }

    pub fn layers(&self) -> impl Iterator<Item = &L> {
        self.links.iter().map(|link| &link.layer)
    }

    /// Assemble the chain's single logical content stream: each layer's
    /// content is opened from the deepest ancestor upward, handing each
    /// child ownership of the stream below it.
    pub fn open_content(&mut self) -> Result<SharedStream, DiskError> {
        let mut lower: Option<StreamRef> = None;
        for link in self.links.iter_mut().rev() {
            let content = link.layer.open_content(lower.take())?;
            lower = Some(StreamRef::owned(content));
        }

        // The loop ran at least once; links is never empty.
        match lower {
            Some(top) => Ok(top.into_stream()),
            None => Err(DiskError::Corrupt("a disk chain requires at least one layer".to_string())),
        }
    }
}

fn release_links<L: ChainLayer>(links: &mut [ChainLink<L>]) {
    for link in links.iter_mut().rev() {
        if link.ownership == Ownership::Dispose {
            link.layer.close();
        }
    }
}

impl<L: ChainLayer> Drop for DiskChain<L> {
    fn drop(&mut self) {
        release_links(&mut self.links);
    }
}
