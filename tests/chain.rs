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

    tests/chain.rs

    Resolution, verification and ownership tests for differencing chains,
    using an in-memory mock image format.
*/

mod common;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use common::MapLocator;
use diskfox::{
    chain::{ChainLayer, DiskChain, FileLocator},
    ownership::{Ownership, StreamRef},
    sparse::{layered::LayeredStream, memory::SparseMemoryStream, SparseStream},
    DiskError,
    Guid,
    SharedStream,
};

const CAPACITY: u64 = 64 * 1024;

fn guid(n: u8) -> Guid {
    Guid::from_fields(n as u32, 0, 0, [n; 8])
}

/// A minimal in-memory image format for exercising the resolver.
struct TestLayer {
    id: Guid,
    parent_id: Guid,
    path: String,
    hints: Vec<String>,
    content: SharedStream,
    closed: Arc<AtomicBool>,
}

impl TestLayer {
    fn new(id: Guid, parent_id: Guid, path: &str, hints: &[&str]) -> TestLayer {
        TestLayer {
            id,
            parent_id,
            path: path.to_string(),
            hints: hints.iter().map(|h| h.to_string()).collect(),
            content: SharedStream::from_stream(SparseMemoryStream::new(CAPACITY)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl ChainLayer for TestLayer {
    fn unique_id(&self) -> Guid {
        self.id
    }

    fn parent_unique_id(&self) -> Guid {
        self.parent_id
    }

    fn capacity(&self) -> u64 {
        CAPACITY
    }

    fn full_path(&self) -> String {
        self.path.clone()
    }

    fn parent_location_hints(&self) -> Vec<String> {
        self.hints.clone()
    }

    fn open_content(&mut self, parent: Option<StreamRef>) -> Result<Box<dyn SparseStream>, DiskError> {
        match parent {
            Some(parent) => {
                let stack = LayeredStream::new(vec![
                    StreamRef::new(self.content.clone(), Ownership::None),
                    parent,
                ])?;
                Ok(Box::new(stack))
            }
            None => Ok(Box::new(self.content.clone())),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        self.content.close();
    }
}

/// A registry of mock images keyed by path, sharing closed flags with the
/// test body so teardown can be observed.
struct Registry {
    specs: HashMap<String, (Guid, Guid, Vec<String>)>,
    flags: HashMap<String, Arc<AtomicBool>>,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            specs: HashMap::new(),
            flags: HashMap::new(),
        }
    }

    fn add(&mut self, path: &str, id: Guid, parent_id: Guid, hints: &[&str]) -> Arc<AtomicBool> {
        self.specs.insert(
            path.to_string(),
            (id, parent_id, hints.iter().map(|h| h.to_string()).collect()),
        );
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.insert(path.to_string(), flag.clone());
        flag
    }

    fn open(&self, path: &str) -> Result<TestLayer, DiskError> {
        let (id, parent_id, hints) = self
            .specs
            .get(path)
            .cloned()
            .ok_or_else(|| DiskError::Io(format!("no such image: {}", path)))?;
        let mut layer = TestLayer::new(id, parent_id, path, &[]);
        layer.hints = hints;
        layer.closed = self.flags[path].clone();
        Ok(layer)
    }

    fn locator(&self) -> MapLocator {
        let mut locator = MapLocator::new();
        for path in self.specs.keys() {
            locator.insert(path, common::memory_stream(0));
        }
        locator
    }
}

#[test]
fn three_link_chain_resolves_in_order() {
    common::init();

    let mut registry = Registry::new();
    registry.add("b.img", guid(2), guid(3), &["c.img"]);
    registry.add("c.img", guid(3), Guid::NIL, &[]);
    let locator = registry.locator();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &["missing.img", "b.img"]);
    let chain = DiskChain::resolve(top, Ownership::Dispose, &locator, |_, path| registry.open(path)).unwrap();

    assert_eq!(chain.layer_count(), 3);
    let ids: Vec<Guid> = chain.layers().map(|l| l.unique_id()).collect();
    assert_eq!(ids, vec![guid(1), guid(2), guid(3)]);
    assert!(!chain.layers().last().unwrap().needs_parent());
    assert_eq!(chain.capacity(), CAPACITY);
}

#[test]
fn mismatched_parent_fails_and_closes_everything() {
    common::init();

    let mut registry = Registry::new();
    // The file at the hint exists but carries the wrong fingerprint.
    let impostor_flag = registry.add("b.img", guid(9), Guid::NIL, &[]);
    let locator = registry.locator();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &["b.img"]);
    let top_flag = top.closed_flag();

    let err = DiskChain::resolve(top, Ownership::Dispose, &locator, |_, path| registry.open(path)).unwrap_err();
    match err {
        DiskError::ChainMismatch { expected, found, .. } => {
            assert_eq!(expected, guid(2));
            assert_eq!(found, guid(9));
        }
        other => panic!("expected ChainMismatch, got {:?}", other),
    }

    // No handles remain open: the impostor and the top layer were released.
    assert!(impostor_flag.load(Ordering::Relaxed));
    assert!(top_flag.load(Ordering::Relaxed));
}

#[test]
fn exhausted_hints_fail_with_parent_not_found() {
    common::init();

    let registry = Registry::new();
    let locator = registry.locator();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &["x.img", "y.img"]);
    let err = DiskChain::resolve(top, Ownership::Dispose, &locator, |_, path| registry.open(path)).unwrap_err();
    match err {
        DiskError::ParentNotFound { child, tried } => {
            assert_eq!(child, "a.img");
            assert_eq!(tried, vec!["x.img".to_string(), "y.img".to_string()]);
        }
        other => panic!("expected ParentNotFound, got {:?}", other),
    }
}

#[test]
fn explicit_layer_list_verifies_adjacency() {
    common::init();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &[]);
    let parent = TestLayer::new(guid(3), Guid::NIL, "b.img", &[]);

    let err = DiskChain::from_layers(vec![(top, Ownership::Dispose), (parent, Ownership::Dispose)]).unwrap_err();
    assert!(matches!(err, DiskError::ChainMismatch { .. }));

    // A chain whose last layer still needs a parent is incomplete.
    let orphan = TestLayer::new(guid(1), guid(2), "a.img", &[]);
    let err = DiskChain::from_layers(vec![(orphan, Ownership::Dispose)]).unwrap_err();
    assert!(matches!(err, DiskError::ParentNotFound { .. }));
}

#[test]
fn ownership_tags_are_honored_per_layer() {
    common::init();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &[]);
    let parent = TestLayer::new(guid(2), Guid::NIL, "b.img", &[]);
    let top_flag = top.closed_flag();
    let parent_flag = parent.closed_flag();

    let chain = DiskChain::from_layers(vec![(top, Ownership::Dispose), (parent, Ownership::None)]).unwrap();
    drop(chain);

    assert!(top_flag.load(Ordering::Relaxed), "owned top layer must be released");
    assert!(!parent_flag.load(Ordering::Relaxed), "borrowed parent must stay open");
}

#[test]
fn content_stream_spans_the_chain() {
    common::init();

    let top = TestLayer::new(guid(1), guid(2), "a.img", &[]);
    let parent = TestLayer::new(guid(2), Guid::NIL, "b.img", &[]);

    // Parent stores a marker the child does not shadow, and one it does.
    parent.content.write_all_at(0, &[0xBB; 8192]).unwrap();
    top.content.write_all_at(0, &[0xAA; 4096]).unwrap();

    let mut chain = DiskChain::from_layers(vec![(top, Ownership::Dispose), (parent, Ownership::Dispose)]).unwrap();
    let content = chain.open_content().unwrap();
    assert_eq!(content.len(), CAPACITY);

    let mut buf = [0u8; 8192];
    content.read_exact_at(0, &mut buf).unwrap();
    assert!(buf[..4096].iter().all(|&b| b == 0xAA), "child shadows parent");
    assert!(buf[4096..].iter().all(|&b| b == 0xBB), "reads fall through to parent");
}

#[test]
fn locator_open_is_exercised_by_real_formats() {
    // The mock layers above bypass locator.open; make sure MapLocator's
    // open contract behaves for the formats that do use it.
    let mut locator = MapLocator::new();
    locator.insert("base.img", common::memory_stream(1024));
    assert!(locator.exists("base.img"));
    assert!(locator.open("base.img", false).is_ok());
    assert!(locator.open("other.img", false).is_err());
    assert_eq!(locator.resolve_absolute("base.img"), "base.img");
}
