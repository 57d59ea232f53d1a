use std::net::IpAddr;

use chrono::NaiveDate;
use mediavault::access::{AccessRule, DateRange, RuleType, Subnet};
use mediavault::config::RepositoryConfig;
use mediavault::identity::{User, UserGroup};
use mediavault::repository::AccessRequest;
use mediavault::workflow::{StepRegistry, WorkflowEngine};
use mediavault::{FileAttachment, Node, NodeId, Repository};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Archive {
    repo: Repository,
    collection: NodeId,
    image: NodeId,
    editors: mediavault::GroupId,
    alice: mediavault::UserId,
}

fn archive() -> Archive {
    init_tracing();
    let mut config = RepositoryConfig::default();
    config.retention = None;
    let mut repo = Repository::open(config).unwrap();
    let root = repo.root();

    let collections = repo
        .create_node(root, Node::new("collections", "collections"))
        .unwrap();
    let collection = repo
        .create_node(collections, Node::new("collection", "photos"))
        .unwrap();
    let image = repo
        .create_node(collection, Node::new("image", "harbour").with_schema("photo"))
        .unwrap();
    repo.attach_file(
        image,
        FileAttachment::new("photos/harbour.tif", "original", "image/tiff"),
    )
    .unwrap();

    let mut editor_group = UserGroup::new("editors");
    editor_group.is_editor_group = true;
    let editors = repo.users_mut().add_group(editor_group).unwrap();
    let alice = repo.users_mut().add_user(User::new("alice")).unwrap();
    repo.users_mut().add_to_group(alice, editors).unwrap();

    repo.commit(Some(alice)).unwrap();
    Archive {
        repo,
        collection,
        image,
        editors,
        alice,
    }
}

fn request(user: Option<mediavault::UserId>, ip: &str, date: NaiveDate) -> AccessRequest {
    AccessRequest {
        user,
        ip: Some(ip.parse::<IpAddr>().unwrap()),
        date,
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn rules_inherit_down_the_tree_and_blocking_wins() {
    let mut a = archive();
    let editors_only = AccessRule::for_groups([a.editors]);
    let rule = a.repo.access_mut().add_rule(editors_only);
    a.repo
        .access_mut()
        .create_ruleset("editors", Some("editorial staff".into()))
        .unwrap();
    a.repo
        .access_mut()
        .add_rule_to_ruleset("editors", rule, false, false)
        .unwrap();
    a.repo
        .link_ruleset(a.collection, "editors", RuleType::Write, false, false)
        .unwrap();

    let today = day(2024, 5, 1);
    let alice = request(Some(a.alice), "10.1.2.3", today);
    let guest = request(None, "10.1.2.3", today);
    assert!(a.repo.has_access(a.image, RuleType::Write, &alice).unwrap());
    assert!(!a.repo.has_access(a.image, RuleType::Write, &guest).unwrap());

    // Own rules on the image replace the inherited ones.
    let blocked_net: Subnet = "10.1.0.0/16".parse().unwrap();
    a.repo
        .add_node_rule(
            a.image,
            RuleType::Write,
            AccessRule::for_subnets([blocked_net]),
            false,
            true,
        )
        .unwrap();
    assert!(!a.repo.has_access(a.image, RuleType::Write, &alice).unwrap());

    a.repo
        .link_ruleset(a.image, "editors", RuleType::Write, false, false)
        .unwrap();
    assert!(!a.repo.has_access(a.image, RuleType::Write, &alice).unwrap());
    let outside = request(Some(a.alice), "192.168.0.7", today);
    assert!(a.repo.has_access(a.image, RuleType::Write, &outside).unwrap());

    let info = a.repo.node_info(a.image).unwrap();
    assert!(info.write_rules.iter().any(|l| l == "Special Rules:"));
    assert!(info.write_rules.iter().any(|l| l.contains("editors")));
}

#[test]
fn embargo_date_range_controls_data_access() {
    let mut a = archive();
    let embargo = DateRange {
        start: Some(day(2025, 1, 1)),
        end: None,
    };
    a.repo
        .add_node_rule(a.image, RuleType::Data, AccessRule::for_dates([embargo]), false, false)
        .unwrap();

    let before = request(None, "127.0.0.1", day(2024, 12, 31));
    let after = request(None, "127.0.0.1", day(2025, 1, 1));
    assert!(!a.repo.has_access(a.image, RuleType::Data, &before).unwrap());
    assert!(a.repo.has_access(a.image, RuleType::Data, &after).unwrap());
}

#[test]
fn admins_bypass_rules() {
    let mut a = archive();
    let mut admin_group = UserGroup::new("administration");
    admin_group.is_admin_group = true;
    let admins = a.repo.users_mut().add_group(admin_group).unwrap();
    let root_user = a.repo.users_mut().add_user(User::new("root")).unwrap();
    a.repo.users_mut().add_to_group(root_user, admins).unwrap();

    let req = request(Some(root_user), "8.8.8.8", day(2024, 1, 1));
    assert!(a.repo.has_access(a.image, RuleType::Write, &req).unwrap());
}

#[test]
fn tagged_versions_and_revert() {
    let mut a = archive();
    let (_, tagged) = a
        .repo
        .new_tagged_version(a.image, None, Some("publish".into()), Some(a.alice), |n| {
            n.set("title", "Harbour at dawn")
        })
        .unwrap();
    let version = a.repo.versions().find(tagged).unwrap();
    assert_eq!(version.tag.as_deref(), Some("2"));
    assert_eq!(version.comment.as_deref(), Some("publish"));
    assert!(version.changeset.contains("attrs"));

    a.repo
        .set_attrs(a.image, [("title", "Harbour at dusk")])
        .unwrap();
    a.repo.commit(Some(a.alice)).unwrap();
    assert_eq!(a.repo.versions().next_tag(a.image).unwrap(), "3");

    a.repo.revert(tagged, false).unwrap();
    a.repo.commit(Some(a.alice)).unwrap();
    let latest = a.repo.versions().latest(a.image).unwrap();
    assert_eq!(latest.get("title"), Some("Harbour at dawn"));
    assert_eq!(a.repo.versions().tagged_versions(a.image).len(), 1);
}

#[test]
fn protect_workflow_sets_key_and_records_versions() {
    let mut a = archive();
    let root = a.repo.root();
    let engine = WorkflowEngine::new(
        StepRegistry::with_builtin_steps(),
        a.repo.config().workflow.clone(),
    );
    let workflows = a
        .repo
        .create_node(root, Node::new("workflows", "workflows"))
        .unwrap();
    let workflow = engine.create_workflow(&mut a.repo, workflows, "review").unwrap();
    engine
        .add_step(&mut a.repo, workflow, "workflowstep_start", "start", Some("protect"), None)
        .unwrap();
    engine
        .add_step(&mut a.repo, workflow, "workflowstep_protect", "protect", Some("done"), None)
        .unwrap();
    let done = engine
        .add_step(&mut a.repo, workflow, "workflowstep_end", "done", None, None)
        .unwrap();
    a.repo.commit(None).unwrap();

    let run = engine.start(&mut a.repo, workflow, a.image).unwrap();
    assert_eq!(run.final_step, done);
    assert!(a.repo.store().node(a.image).unwrap().get("key").is_some());
    assert_eq!(engine.current_step(&a.repo, workflow, a.image), Some(done));
    // Still reachable through the collection as well as the workflow step.
    assert_eq!(a.repo.store().parent_ids(a.image).len(), 2);
}

#[test]
fn purge_removes_detached_subtrees() {
    let mut a = archive();
    let root = a.repo.root();
    let collections = a.repo.store().parent_ids(a.collection)[0];
    a.repo
        .add_node_rule(a.collection, RuleType::Read, AccessRule::default(), false, false)
        .unwrap();
    a.repo.store_mut().unlink(collections, a.collection).unwrap();

    let mut purged = a.repo.purge_unreachable();
    purged.sort();
    let mut expected = vec![a.collection, a.image];
    expected.sort();
    assert_eq!(purged, expected);
    assert!(a.repo.store().file_owner("photos/harbour.tif").is_none());
    assert!(a.repo.versions().versions(a.image).is_empty());
    assert!(a.repo.store().contains(&root));
    a.repo.store().assert_graph_invariants().unwrap();
}

#[test]
fn home_directories_live_below_home_container() {
    let mut a = archive();
    let home = a.repo.create_home_dir(a.alice).unwrap();
    let user = a.repo.users().user(a.alice).unwrap().clone();
    assert_eq!(user.home_dir, Some(home));
    let upload = a.repo.users().upload_dir(&user, a.repo.store()).unwrap();
    assert_eq!(upload.system_attr("used_as"), Some("upload"));
    assert!(a.repo.store().reachable_ids().contains(&home));
}
