//! Export → import → export equivalence.
//!
//! Ids change on every import, so archives are compared after replacing
//! bundle-local references with the names of the units they point at.

mod common;

use common::*;
use folio_core::markup::{self, Token};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Archive content with ids replaced by names:
/// `(kind, name, parent name)` per node, revision contents per document.
#[derive(Debug, PartialEq, Eq)]
struct Shape {
    nodes: Vec<(String, String, Option<String>)>,
    revisions: BTreeMap<String, Vec<String>>,
}

fn shape(contents: &ArchiveContents) -> Shape {
    let names: HashMap<u64, &str> = contents
        .nodes
        .iter()
        .map(|u| (u.seq, u.name.as_str()))
        .collect();
    let name_of = |seq: u64| names.get(&seq).copied().unwrap_or("?").to_string();

    let mut nodes: Vec<(String, String, Option<String>)> = contents
        .nodes
        .iter()
        .map(|u| (u.kind().to_string(), u.name.clone(), u.parent_seq.map(name_of)))
        .collect();
    nodes.sort();

    let mut revisions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for doc in contents.nodes.iter().filter(|u| u.kind() == NodeKind::Document) {
        let texts = revision_units(contents, doc.seq)
            .iter()
            .map(|r| {
                let content = r.fields.first().map(|f| f.content.as_str()).unwrap_or("");
                markup::map_content(content, str::to_string, |token| match token {
                    Token::Ref(seq) => format!("<ref {}>", name_of(*seq)),
                    Token::Media { seq, version } => {
                        format!("<media {}@{}>", name_of(*seq), version)
                    }
                    other => other.to_string(),
                })
            })
            .collect();
        revisions.insert(doc.name.clone(), texts);
    }
    Shape { nodes, revisions }
}

#[test]
fn reexported_import_matches_original_archive() {
    let src = Instance::new(SOURCE_URL);
    let alice = src.user("alice");
    let bob = src.user("bob");
    let project = src.store.create_folder(None, "Project", alice.user, 1);
    let notebook = src.store.create_notebook(Some(project), "Notebook", alice.user, 2);
    let gel = src.store.create_media(
        Some(project),
        "Gel",
        alice.user,
        "gel.png",
        "image/png",
        b"png".to_vec(),
        3,
    );
    let protocol = src
        .store
        .create_document(Some(notebook), "Protocol", alice.user, data("step 1"), 4);
    let result = src.store.create_document(
        Some(notebook),
        "Result",
        alice.user,
        data(format!("per {} see {}", link(protocol), attachment(gel))),
        5,
    );
    src.store.add_revision(protocol, bob.user, data(format!("step 1, then {}", link(result))), 6);
    src.store.add_comment(result, bob.user, "checked", 7);

    let config = ExportConfig::structured().with_all_versions(true);
    let original = read(&src.export(&alice, ExportScope::Folder(project), config.clone()));

    let tgt = Instance::new(TARGET_URL);
    let admin = tgt.user("admin");
    let bundle_path = src.archive_dir().join(original_path(&src));
    let report = tgt.import(&admin, &bundle_path, ImportConfig::create_users());
    assert!(report.success(), "errors: {:?}", report.errors);

    let new_project = report.new_id(project).unwrap();
    let new_alice = tgt.store.identity(tgt.store.user_by_name("alice").unwrap().unwrap().id);
    let reexported = read(&tgt.export(&new_alice, ExportScope::Folder(new_project), config));

    assert_eq!(shape(&original), shape(&reexported));
}

/// File name of the only archive in an instance's archive directory.
fn original_path(instance: &Instance) -> String {
    let files = instance.archive_files();
    assert_eq!(files.len(), 1, "expected one archive, found {:?}", files);
    files[0].clone()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn revision_history_survives_round_trip(texts in prop::collection::vec("[a-z ]{0,16}", 1..6)) {
        let src = Instance::new(SOURCE_URL);
        let alice = src.user("alice");
        let doc = src.store.create_document(None, "Doc", alice.user, data(texts[0].clone()), 1);
        for (i, text) in texts.iter().enumerate().skip(1) {
            src.store.add_revision(doc, alice.user, data(text.clone()), i as i64 + 1);
        }
        let bundle = src.export(
            &alice,
            ExportScope::Record(doc),
            ExportConfig::structured().with_all_versions(true),
        );

        let tgt = Instance::new(TARGET_URL);
        let admin = tgt.user("admin");
        let report = tgt.import(&admin, &bundle.path, ImportConfig::ignore_users());
        let new_doc = report.new_id(doc).unwrap();

        let revisions = tgt.revisions(new_doc);
        let numbers: Vec<u32> = revisions.iter().map(|r| r.number).collect();
        let expected: Vec<u32> = (1..=texts.len() as u32).collect();
        prop_assert_eq!(numbers, expected);
        let contents: Vec<String> = revisions.iter().map(|r| r.fields[0].content.clone()).collect();
        prop_assert_eq!(&contents, &texts);
        let times: Vec<i64> = revisions.iter().map(|r| r.modified_at).collect();
        let expected_times: Vec<i64> = (1..=texts.len() as i64).collect();
        prop_assert_eq!(times, expected_times);
    }
}
