#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use msg_fs::fs::ops::VfsState;
use msg_fs::fs::update_bridge::{
    Invalidation, NoopNotifier, ProducerError, TreeOp, UpdateBridge, apply_events,
};
use msg_fs::fs::{InodeAddr, ROOT_INODE};
use msg_fs::vfs::{
    ContentItem, DirContent, DirItem, ExcludeEmpty, StaticDirContent, TreeError, UpdateEvent,
    VfsTree, Wrapper,
};

use common::vfs_mocks::file;
use common::{Inval, mount, names};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_directory_scenario_with_exclude_empty() {
    let m = mount();
    m.producer.create_dir("/a").await.unwrap();
    m.producer
        .add_wrapper("/a", Arc::new(ExcludeEmpty::new()) as Arc<dyn Wrapper>)
        .await
        .unwrap();
    m.producer.create_dir("/a/b").await.unwrap();
    let msg = file("msg.eml", b"Subject: hi");
    m.producer
        .put_content(vec![msg.clone()], "/a/b", false)
        .await
        .unwrap();

    assert_eq!(m.list_path("/").await, names(&["a"]));
    assert_eq!(m.list_path("/a").await, names(&["b"]));
    assert_eq!(m.list_path("/a/b").await, names(&["msg.eml"]));
    let b = m.resolve("/a/b").await.unwrap();

    m.producer.remove_content(msg, "/a/b").await.unwrap();
    assert!(
        m.list_path("/a").await.is_empty(),
        "/a/b became empty and is hidden"
    );

    m.producer.remove_dir("/a/b").await.unwrap();
    let state = m.ops.state().lock().await;
    assert!(state.inodes.get_by_path("/a/b").is_none());
    assert!(
        state.inodes.get_item_by_inode(b).is_none(),
        "the former inode of /a/b is gone"
    );
    assert!(!state.tree.contains("/a/b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_dir_drops_the_whole_subtree() {
    let m = mount();
    m.producer.create_dir("/a/b/c").await.unwrap();
    m.producer
        .put_content(vec![file("deep", b"x")], "/a/b/c", false)
        .await
        .unwrap();
    let a = m.resolve("/a").await.unwrap();
    let deep = m.resolve("/a/b/c/deep").await.unwrap();
    m.notifier.take();

    m.producer.remove_dir("/a").await.unwrap();

    let calls = m.notifier.take();
    assert!(calls.contains(&Inval::Entry(ROOT_INODE, OsString::from("a"))));
    assert!(calls.contains(&Inval::Inode(a)), "looked-up inodes are invalidated");
    assert!(calls.contains(&Inval::Inode(deep)));

    let state = m.ops.state().lock().await;
    for path in ["/a", "/a/b", "/a/b/c", "/a/b/c/deep"] {
        assert!(state.inodes.get_by_path(path).is_none(), "{path} still resolves");
    }
    assert!(state.inodes.get_item_by_inode(deep).is_none());
    assert_eq!(state.inodes.len(), 1, "only the root is left");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_name_put_remove_put_gets_a_fresh_inode() {
    let m = mount();
    let first = file("x", b"first");
    m.producer
        .put_content(vec![first.clone()], "/", false)
        .await
        .unwrap();
    let first_ino = m.resolve("/x").await.unwrap();

    m.producer.remove_content(first, "/").await.unwrap();
    assert_eq!(m.resolve("/x").await, Err(libc::ENOENT));

    m.producer
        .put_content(vec![file("x", b"second")], "/", false)
        .await
        .unwrap();
    let second_ino = m.resolve("/x").await.unwrap();

    assert_ne!(first_ino, second_ino, "removed inodes are never reused");
    assert_eq!(m.list(ROOT_INODE).await, names(&["x"]));
    assert_eq!(m.read_all(second_ino).await, b"second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newest_duplicate_wins_and_removal_reveals_the_older() {
    let m = mount();
    let older = file("dup", b"older");
    let newer = file("dup", b"newer");
    m.producer
        .put_content(vec![older.clone()], "/", false)
        .await
        .unwrap();
    m.list(ROOT_INODE).await;
    m.producer
        .put_content(vec![newer.clone()], "/", false)
        .await
        .unwrap();

    assert_eq!(m.list(ROOT_INODE).await, names(&["dup"]), "one entry per name");
    let dup = m.resolve("/dup").await.unwrap();
    assert_eq!(m.read_all(dup).await, b"newer");

    m.producer.remove_content(newer, "/").await.unwrap();
    let dup = m.resolve("/dup").await.unwrap();
    assert_eq!(m.read_all(dup).await, b"older", "the shadowed item is revealed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_for_unread_directories_are_skipped() {
    let m = mount();
    m.producer.create_dir("/a").await.unwrap();
    m.producer
        .put_content(vec![file("m", b"x")], "/a", false)
        .await
        .unwrap();

    assert!(m.notifier.take().is_empty(), "the kernel has seen nothing yet");
    assert_eq!(m.ops.state().lock().await.inodes.len(), 1);

    assert_eq!(
        m.list_path("/a").await,
        names(&["m"]),
        "a first visit reads the current tree"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_looked_up_inodes_get_inode_invalidations() {
    let m = mount();
    m.list(ROOT_INODE).await;

    let seen = file("seen", b"1");
    let unseen = file("unseen", b"2");
    m.producer
        .put_content(vec![seen.clone(), unseen.clone()], "/", false)
        .await
        .unwrap();
    assert_eq!(
        m.notifier.take(),
        vec![
            Inval::Entry(ROOT_INODE, OsString::from("seen")),
            Inval::Entry(ROOT_INODE, OsString::from("unseen")),
        ]
    );

    let seen_ino = m.resolve("/seen").await.unwrap();
    m.producer.remove_content(seen, "/").await.unwrap();
    m.producer.remove_content(unseen, "/").await.unwrap();

    assert_eq!(
        m.notifier.take(),
        vec![
            Inval::Entry(ROOT_INODE, OsString::from("seen")),
            Inval::Inode(seen_ino),
            Inval::Entry(ROOT_INODE, OsString::from("unseen")),
        ],
        "readdir alone never hands out a lookup reference"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overwrite_replaces_every_item() {
    let m = mount();
    m.producer
        .put_content(vec![file("a", b"1"), file("b", b"2")], "/", false)
        .await
        .unwrap();
    assert_eq!(m.list(ROOT_INODE).await, names(&["a", "b"]));

    m.producer
        .put_content(vec![file("c", b"3")], "/", true)
        .await
        .unwrap();
    assert_eq!(m.list(ROOT_INODE).await, names(&["c"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_stops_at_the_first_failing_op() {
    let m = mount();
    m.list(ROOT_INODE).await;

    let result = m
        .producer
        .apply(vec![
            TreeOp::CreateDir("/ok".to_owned()),
            TreeOp::RemoveDir("/missing".to_owned()),
            TreeOp::CreateDir("/never".to_owned()),
        ])
        .await;

    assert!(
        matches!(result, Err(ProducerError::Tree(TreeError::NotFound(ref p))) if p == "/missing"),
        "got {result:?}"
    );
    assert_eq!(
        m.list(ROOT_INODE).await,
        names(&["ok"]),
        "ops before the failure stay applied"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_reports_a_stopped_bridge() {
    let state = VfsState::new(VfsTree::new()).shared();
    let (bridge, producer) = UpdateBridge::new(state, Arc::new(NoopNotifier), 4);
    drop(bridge);

    assert!(matches!(
        producer.create_dir("/a").await,
        Err(ProducerError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_bad_event_does_not_block_the_rest() {
    let mut state = VfsState::new(VfsTree::new());
    state.inodes.get_mut(ROOT_INODE).unwrap().data.content_read = true;

    let events = vec![
        UpdateEvent::NewDirs {
            path: "/".to_owned(),
            dirs: vec!["/ghost".to_owned()],
        },
        UpdateEvent::NewItems {
            path: "/".to_owned(),
            items: vec![file("f", b"x")],
        },
    ];
    let invalidations = apply_events(&mut state, &events);

    assert_eq!(
        invalidations,
        vec![Invalidation::Entry {
            parent: ROOT_INODE,
            name: OsString::from("f"),
        }]
    );
    assert!(state.inodes.get_by_path("/ghost").is_none());
    assert!(state.inodes.get_by_path("/f").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subdirectory_outranks_a_file_with_the_same_name() {
    let m = mount();
    m.producer.create_dir("/same").await.unwrap();
    m.list(ROOT_INODE).await;
    m.producer
        .put_content(vec![file("same", b"file")], "/", false)
        .await
        .unwrap();

    let same = m.ops.lookup(ROOT_INODE, "same".as_ref()).await.unwrap();
    assert_eq!(same.itype, msg_fs::fs::INodeType::Directory);
}

fn source_dir(name: &str, items: Vec<ContentItem>) -> ContentItem {
    ContentItem::Dir(DirItem::new(
        name,
        DirContent::Source(Arc::new(StaticDirContent::new(items))),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_dir_item_keeps_the_subdirectory_it_was_hidden_by() {
    let m = mount();
    m.producer.create_dir("/a/b").await.unwrap();
    m.producer
        .put_content(vec![file("inner", b"i")], "/a/b", false)
        .await
        .unwrap();
    let hidden = source_dir("b", vec![file("other", b"o")]);
    m.producer
        .put_content(vec![hidden.clone()], "/a", false)
        .await
        .unwrap();
    assert_eq!(m.list_path("/a").await, names(&["b"]));
    assert_eq!(m.list_path("/a/b").await, names(&["inner"]));

    m.producer.remove_content(hidden, "/a").await.unwrap();

    assert_eq!(m.list_path("/a").await, names(&["b"]));
    assert_eq!(
        m.list_path("/a/b").await,
        names(&["inner"]),
        "the subdirectory is still the one registered"
    );
    assert!(m.resolve("/a/b/inner").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dir_item_put_over_a_read_subdirectory_stays_hidden() {
    let m = mount();
    m.producer.create_dir("/a/b").await.unwrap();
    m.producer
        .put_content(vec![file("inner", b"i")], "/a/b", false)
        .await
        .unwrap();
    let b = m.resolve("/a/b").await.unwrap();
    m.list_path("/a").await;

    m.producer
        .put_content(vec![source_dir("b", Vec::new())], "/a", false)
        .await
        .unwrap();

    assert_eq!(m.resolve("/a/b").await.unwrap(), b, "the subdirectory keeps its inode");
    assert!(m.resolve("/a/b/inner").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_subdirectory_reveals_the_item_it_hid() {
    let m = mount();
    m.producer.create_dir("/same").await.unwrap();
    m.producer
        .put_content(vec![file("same", b"file")], "/", false)
        .await
        .unwrap();
    m.list(ROOT_INODE).await;

    m.producer.remove_dir("/same").await.unwrap();

    let same = m.ops.lookup(ROOT_INODE, "same".as_ref()).await.unwrap();
    assert_eq!(same.itype, msg_fs::fs::INodeType::File);
    assert_eq!(m.read_all(same.addr).await, b"file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrapper_added_to_a_read_directory_tracks_existing_children() {
    let m = mount();
    m.producer.create_dir("/a/b").await.unwrap();
    let x = file("x", b"data");
    m.producer
        .put_content(vec![x.clone()], "/a/b", false)
        .await
        .unwrap();
    assert_eq!(m.list_path("/a").await, names(&["b"]));
    assert_eq!(m.list_path("/a/b").await, names(&["x"]));

    m.producer
        .add_wrapper("/a", Arc::new(ExcludeEmpty::new()) as Arc<dyn Wrapper>)
        .await
        .unwrap();
    assert_eq!(m.list_path("/a").await, names(&["b"]), "/a/b is not empty");

    m.producer.remove_content(x, "/a/b").await.unwrap();

    assert!(m.list_path("/a").await.is_empty(), "/a/b became empty");
    assert_eq!(m.resolve("/a/b/x").await, Err(libc::ENOENT));
    assert_eq!(m.resolve("/a/b").await, Err(libc::ENOENT));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrapper_added_to_a_read_directory_changes_its_listing() {
    let m = mount();
    m.producer.create_dir("/a/empty").await.unwrap();
    m.producer
        .put_content(vec![file("f", b"1")], "/a", false)
        .await
        .unwrap();
    let a = m.resolve("/a").await.unwrap();
    assert_eq!(m.list(a).await, names(&["empty", "f"]));
    let f = m.resolve("/a/f").await.unwrap();
    m.notifier.take();

    m.producer
        .add_wrapper("/a", Arc::new(ExcludeEmpty::new()) as Arc<dyn Wrapper>)
        .await
        .unwrap();

    assert_eq!(m.list(a).await, names(&["f"]));
    assert_eq!(m.resolve("/a/empty").await, Err(libc::ENOENT));
    assert_eq!(m.resolve("/a/f").await.unwrap(), f, "untouched entries keep their inode");
    assert!(
        m.notifier
            .take()
            .contains(&Inval::Entry(a, OsString::from("empty"))),
        "the kernel drops the hidden entry"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_skips_removals_of_missing_targets() {
    let m = mount();
    m.producer.create_dir("/keep").await.unwrap();
    m.list(ROOT_INODE).await;

    m.producer
        .sync(vec![
            TreeOp::RemoveDir("/missing".to_owned()),
            TreeOp::RemoveContent {
                item: file("ghost", b""),
                path: "/keep".to_owned(),
            },
            TreeOp::RemoveContent {
                item: file("ghost", b""),
                path: "/missing".to_owned(),
            },
            TreeOp::PutContent {
                items: vec![file("after", b"a")],
                path: "/".to_owned(),
                overwrite: false,
            },
        ])
        .await
        .unwrap();
    assert_eq!(m.list(ROOT_INODE).await, names(&["after", "keep"]));

    let result = m
        .producer
        .sync(vec![TreeOp::PutContent {
            items: vec![file("nowhere", b"")],
            path: "/missing".to_owned(),
            overwrite: false,
        }])
        .await;
    assert!(
        matches!(result, Err(ProducerError::Tree(TreeError::NotFound(_)))),
        "only removals are forgiven, got {result:?}"
    );
}

fn all_inodes(state: &VfsState) -> Vec<InodeAddr> {
    let mut out = Vec::new();
    let mut stack = vec![ROOT_INODE];
    while let Some(ino) = stack.pop() {
        out.push(ino);
        stack.extend(state.inodes.children(ino).map(|(_, child)| child));
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_registered_path_resolves_back_to_its_inode() {
    let m = mount();
    m.producer.create_dir("/x/y").await.unwrap();
    m.producer.create_dir("/z").await.unwrap();
    m.producer
        .put_content(vec![file("f1", b"1")], "/x/y", false)
        .await
        .unwrap();
    m.producer
        .put_content(vec![file("f2", b"2")], "/", false)
        .await
        .unwrap();
    for dir in ["/", "/x", "/x/y", "/z"] {
        m.list_path(dir).await;
    }

    let paths: Vec<_> = {
        let state = m.ops.state().lock().await;
        all_inodes(&state)
            .into_iter()
            .map(|ino| (ino, state.inodes.get_item_path(ino).unwrap()))
            .collect()
    };
    assert_eq!(paths.len(), 6, "root, x, y, f1, z and f2");
    for (ino, path) in paths {
        let resolved = m.resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(resolved, ino, "{} resolved elsewhere", path.display());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_are_never_partially_visible() {
    let m = mount();
    m.producer.create_dir("/inbox").await.unwrap();
    m.list_path("/inbox").await;

    let producer = m.producer.clone();
    let writer = tokio::spawn(async move {
        let mut previous = None;
        for i in 0..50u32 {
            let name = format!("msg-{i}");
            let item = msg_fs::vfs::ContentItem::File(msg_fs::vfs::FileItem::new(
                name,
                Arc::new(msg_fs::vfs::BytesContent::new(i.to_string())),
            ));
            let mut ops = vec![TreeOp::PutContent {
                items: vec![item.clone()],
                path: "/inbox".to_owned(),
                overwrite: false,
            }];
            if let Some(old) = previous.replace(item) {
                ops.push(TreeOp::RemoveContent {
                    item: old,
                    path: "/inbox".to_owned(),
                });
            }
            producer.apply(ops).await.unwrap();
        }
    });

    while !writer.is_finished() {
        let state = m.ops.state().lock().await;
        let inbox = state.inodes.get_by_path("/inbox").unwrap().inode;
        let registered: Vec<OsString> = state
            .inodes
            .children(inbox)
            .map(|(name, child)| {
                assert!(state.inodes.get_item_by_inode(child).is_some());
                name.to_os_string()
            })
            .collect();
        let listed: Vec<OsString> = state
            .tree
            .list_dir("/inbox")
            .await
            .unwrap()
            .iter()
            .map(|i| i.name().to_os_string())
            .collect();
        assert_eq!(registered, listed, "registry and tree disagree mid-stream");
        assert!(registered.len() <= 1, "each batch swaps one message for another");
        drop(state);
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert_eq!(m.list_path("/inbox").await, names(&["msg-49"]));
    let state = m.ops.state().lock().await;
    assert!(state.inodes.get_by_path(Path::new("/inbox/msg-48")).is_none());
}
