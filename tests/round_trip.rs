use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::DateTime;

use pbf_parallel::models::{
    BoundBox, Element, ElementType, Info, Node, Relation, RelationMember, Way,
};
use pbf_parallel::readers::ParallelReader;
use pbf_parallel::writers::PbfWriter;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Degrees exactly on the default 100-nanodegree grid, so values survive the
/// encode/decode cycle bit for bit.
fn coord(raw: i64) -> f64 {
    (raw * 100) as f64 / 1e9
}

fn info(version: i32, changeset: i64, uid: i32, username: &str) -> Option<Info> {
    Some(Info {
        version,
        timestamp: DateTime::from_timestamp_millis(1_600_000_000_000),
        changeset,
        uid,
        username: username.to_owned(),
        visible: true,
    })
}

fn test_nodes() -> Vec<Node> {
    (0..20)
        .map(|i| Node {
            id: i * 7,
            tags: HashMap::from([("name".to_owned(), format!("node-{}", i))]),
            info: info(1, 1000 + i, 42, "alice"),
            lat: coord(i * 13),
            lon: coord(-i * 11),
        })
        .collect()
}

fn test_ways() -> Vec<Way> {
    (0..5)
        .map(|i| Way {
            id: 1000 + i,
            tags: HashMap::from([("highway".to_owned(), "residential".to_owned())]),
            info: info(2, 2000 + i, 7, "bob"),
            nodes: vec![i * 7, i * 7 + 7, i * 7 + 14],
        })
        .collect()
}

fn test_relations() -> Vec<Relation> {
    (0..3)
        .map(|i| Relation {
            id: 5000 + i,
            tags: HashMap::from([("type".to_owned(), "multipolygon".to_owned())]),
            info: info(3, 3000 + i, 9, "carol"),
            members: vec![
                RelationMember {
                    member_id: 1000 + i,
                    member_type: ElementType::Way,
                    role: "outer".to_owned(),
                },
                RelationMember {
                    member_id: i * 7,
                    member_type: ElementType::Node,
                    role: "admin_centre".to_owned(),
                },
            ],
        })
        .collect()
}

fn write_test_stream(use_dense: bool) -> anyhow::Result<Vec<u8>> {
    let mut stream = Vec::new();
    let mut writer = PbfWriter::new(&mut stream, use_dense);
    writer.set_bbox(BoundBox {
        left: coord(-10_000_000),
        right: coord(10_000_000),
        top: coord(5_000_000),
        bottom: coord(-5_000_000),
    });
    for node in test_nodes() {
        writer.write(Element::Node(node))?;
    }
    for way in test_ways() {
        writer.write(Element::Way(way))?;
    }
    for relation in test_relations() {
        writer.write(Element::Relation(relation))?;
    }
    writer.finish()?;
    Ok(stream)
}

struct Collected {
    nodes: Arc<Mutex<Vec<Node>>>,
    ways: Arc<Mutex<Vec<Way>>>,
    relations: Arc<Mutex<Vec<Relation>>>,
}

fn parse_all(stream: Vec<u8>, threads: usize) -> anyhow::Result<Collected> {
    let collected = Collected {
        nodes: Arc::new(Mutex::new(Vec::new())),
        ways: Arc::new(Mutex::new(Vec::new())),
        relations: Arc::new(Mutex::new(Vec::new())),
    };

    let nodes = Arc::clone(&collected.nodes);
    let ways = Arc::clone(&collected.ways);
    let relations = Arc::clone(&collected.relations);
    ParallelReader::new(std::io::Cursor::new(stream), threads)
        .on_node(move |node| nodes.lock().unwrap().push(node))
        .on_way(move |way| ways.lock().unwrap().push(way))
        .on_relation(move |relation| relations.lock().unwrap().push(relation))
        .parse()?;

    collected.nodes.lock().unwrap().sort_by_key(|n| n.id);
    collected.ways.lock().unwrap().sort_by_key(|w| w.id);
    collected.relations.lock().unwrap().sort_by_key(|r| r.id);
    Ok(collected)
}

#[test]
fn dense_write_then_parse_round_trips() -> anyhow::Result<()> {
    init_logging();
    let collected = parse_all(write_test_stream(true)?, 4)?;
    assert_eq!(test_nodes(), *collected.nodes.lock().unwrap());
    assert_eq!(test_ways(), *collected.ways.lock().unwrap());
    assert_eq!(test_relations(), *collected.relations.lock().unwrap());
    Ok(())
}

#[test]
fn sparse_write_then_parse_round_trips() -> anyhow::Result<()> {
    init_logging();
    let collected = parse_all(write_test_stream(false)?, 2)?;
    assert_eq!(test_nodes(), *collected.nodes.lock().unwrap());
    assert_eq!(test_ways(), *collected.ways.lock().unwrap());
    Ok(())
}

#[test]
fn dense_round_trip_keeps_absent_info_absent() -> anyhow::Result<()> {
    init_logging();

    let with_info = Node {
        id: 1,
        info: info(1, 500, 5, "dave"),
        ..Node::default()
    };
    let without_info = Node {
        id: 2,
        ..Node::default()
    };

    let mut stream = Vec::new();
    let mut writer = PbfWriter::new(&mut stream, true);
    writer.write(Element::Node(with_info.clone()))?;
    writer.write(Element::Node(without_info.clone()))?;
    writer.finish()?;

    let collected = parse_all(stream, 2)?;
    assert_eq!(
        vec![with_info, without_info],
        *collected.nodes.lock().unwrap()
    );
    Ok(())
}

#[test]
fn entity_counts_are_invariant_over_worker_count() -> anyhow::Result<()> {
    init_logging();
    let stream = write_test_stream(true)?;
    for threads in [1, 2, 8] {
        let collected = parse_all(stream.clone(), threads)?;
        assert_eq!(test_nodes().len(), collected.nodes.lock().unwrap().len());
        assert_eq!(test_ways().len(), collected.ways.lock().unwrap().len());
        assert_eq!(
            test_relations().len(),
            collected.relations.lock().unwrap().len()
        );
    }
    Ok(())
}

#[test]
fn shards_partition_the_stream_without_overlap() -> anyhow::Result<()> {
    init_logging();

    // One data blob per node: every write is followed by an explicit flush.
    let mut stream = Vec::new();
    let mut writer = PbfWriter::new(&mut stream, true);
    for node in test_nodes() {
        writer.write(Element::Node(node))?;
        writer.flush()?;
    }
    writer.finish()?;

    let partitions = 3;
    let mut union = Vec::new();
    let mut per_shard = Vec::new();
    for shard in 0..partitions {
        let nodes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&nodes);
        ParallelReader::new_sharded(
            std::io::Cursor::new(stream.clone()),
            2,
            partitions,
            shard,
        )
        .on_node(move |node| sink.lock().unwrap().push(node.id))
        .parse()?;
        let ids = nodes.lock().unwrap().clone();
        per_shard.push(ids.clone());
        union.extend(ids);
    }

    // Shards are pairwise disjoint and their union is the whole file.
    union.sort_unstable();
    let expected: Vec<i64> = test_nodes().iter().map(|n| n.id).collect();
    assert_eq!(expected, union);
    for (a, shard_a) in per_shard.iter().enumerate() {
        for (b, shard_b) in per_shard.iter().enumerate() {
            if a != b {
                assert!(shard_a.iter().all(|id| !shard_b.contains(id)));
            }
        }
    }
    Ok(())
}

#[test]
fn header_and_bound_box_are_delivered() -> anyhow::Result<()> {
    init_logging();
    let stream = write_test_stream(true)?;

    let header = Arc::new(Mutex::new(None));
    let bbox = Arc::new(Mutex::new(None));
    let header_sink = Arc::clone(&header);
    let bbox_sink = Arc::clone(&bbox);
    ParallelReader::new(std::io::Cursor::new(stream), 2)
        .on_header(move |h| *header_sink.lock().unwrap() = Some(h))
        .on_bound_box(move |b| *bbox_sink.lock().unwrap() = Some(b))
        .parse()?;

    let header = header.lock().unwrap().clone().expect("header not delivered");
    assert!(header
        .required_features
        .contains(&"DenseNodes".to_owned()));
    assert!(header.writing_program.is_some());

    let bbox = bbox.lock().unwrap().expect("bound box not delivered");
    assert_eq!(coord(-10_000_000), bbox.left);
    assert_eq!(coord(5_000_000), bbox.top);
    assert_eq!(header.bbox, Some(bbox));
    Ok(())
}

#[test]
fn header_only_file_completes_without_entities() -> anyhow::Result<()> {
    init_logging();

    let mut stream = Vec::new();
    let mut writer = PbfWriter::new(&mut stream, true);
    writer.finish()?;

    let entities = Arc::new(AtomicU64::new(0));
    let header_seen = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));

    let counter = Arc::clone(&entities);
    let way_counter = Arc::clone(&entities);
    let header_sink = Arc::clone(&header_seen);
    let done = Arc::clone(&completed);
    ParallelReader::new(std::io::Cursor::new(stream), 2)
        .on_node(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .on_way(move |_| {
            way_counter.fetch_add(1, Ordering::Relaxed);
        })
        .on_header(move |_| header_sink.store(true, Ordering::SeqCst))
        .on_complete(move || done.store(true, Ordering::SeqCst))
        .parse()?;

    assert!(header_seen.load(Ordering::SeqCst));
    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(0, entities.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn changesets_are_not_invented() -> anyhow::Result<()> {
    init_logging();
    let stream = write_test_stream(true)?;

    let changesets = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&changesets);
    ParallelReader::new(std::io::Cursor::new(stream), 2)
        .on_changeset(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .parse()?;

    assert_eq!(0, changesets.load(Ordering::Relaxed));
    Ok(())
}
