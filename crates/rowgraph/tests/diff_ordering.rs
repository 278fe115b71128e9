//! Random edit sequences: recorded operations stay ordered, commits land
//! the final state and rollbacks restore the loaded one.

mod common;

use common::{artist_id, domain, group_id, painting_id, seeded};
use proptest::prelude::*;
use rowgraph::prelude::*;
use rowgraph::NodeDiff;

const NAMES: [&str; 3] = ["Manet", "Degas", "Cassatt"];
const PAINTINGS: [i64; 4] = [10, 11, 20, 21];

#[derive(Debug, Clone)]
enum Edit {
    Rename { artist: usize, name: usize },
    Move { painting: usize, artist: usize },
    ToggleGroup { artist: usize },
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0usize..2, 0usize..NAMES.len()).prop_map(|(artist, name)| Edit::Rename { artist, name }),
        (0usize..PAINTINGS.len(), 0usize..2).prop_map(|(painting, artist)| Edit::Move { painting, artist }),
        (0usize..2).prop_map(|artist| Edit::ToggleGroup { artist }),
    ]
}

/// What the data source should hold after a commit.
#[derive(Debug, Clone, PartialEq)]
struct Expected {
    names: [String; 2],
    owners: [usize; 4],
    members: [bool; 2],
}

impl Expected {
    fn seeded() -> Self {
        Self {
            names: ["Monet".to_string(), "Renoir".to_string()],
            owners: [0, 0, 1, 1],
            members: [true, true],
        }
    }
}

struct Graph {
    artists: Vec<ObjectRef>,
    paintings: Vec<ObjectRef>,
    group: ObjectRef,
}

impl Graph {
    fn load(context: &DataContext) -> Self {
        let fetch = |id: &ObjectId| context.object_for_id(id).unwrap().unwrap();
        Self {
            artists: vec![fetch(&artist_id(1)), fetch(&artist_id(2))],
            paintings: PAINTINGS.iter().map(|&n| fetch(&painting_id(n))).collect(),
            group: fetch(&group_id(5)),
        }
    }

    fn observe(&self, context: &DataContext) -> Expected {
        let artist_index = |object: &ObjectRef| {
            self.artists
                .iter()
                .position(|a| a.object_id() == object.object_id())
                .unwrap()
        };
        let names = [0, 1].map(|i| {
            context
                .read_attribute(&self.artists[i], "name")
                .unwrap()
                .as_str()
                .unwrap_or_default()
                .to_string()
        });
        let owners = [0, 1, 2, 3].map(|i| {
            let owner = context.read_to_one(&self.paintings[i], "artist").unwrap().unwrap();
            artist_index(&owner)
        });
        let members = [0, 1].map(|i| {
            context
                .read_to_many(&self.artists[i], "groups")
                .unwrap()
                .iter()
                .any(|g| g.object_id() == self.group.object_id())
        });
        Expected { names, owners, members }
    }

    fn apply(&self, context: &DataContext, edit: &Edit, expected: &mut Expected) {
        match *edit {
            Edit::Rename { artist, name } => {
                context.write_property(&self.artists[artist], "name", NAMES[name]).unwrap();
                expected.names[artist] = NAMES[name].to_string();
            }
            Edit::Move { painting, artist } => {
                context
                    .set_to_one(&self.paintings[painting], "artist", Some(&self.artists[artist]))
                    .unwrap();
                expected.owners[painting] = artist;
            }
            Edit::ToggleGroup { artist } => {
                if expected.members[artist] {
                    context.remove_to_many(&self.artists[artist], "groups", &self.group).unwrap();
                } else {
                    context.add_to_many(&self.artists[artist], "groups", &self.group).unwrap();
                }
                expected.members[artist] = !expected.members[artist];
            }
        }
    }
}

fn explicit_ids(context: &DataContext) -> Vec<u64> {
    context
        .object_store()
        .lock()
        .changes()
        .iter()
        .filter(|d| !matches!(d, NodeDiff::NodePropertyChanged { .. }))
        .map(NodeDiff::diff_id)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_recorded_operations_keep_their_order(edits in prop::collection::vec(edit(), 1..16)) {
        let source = seeded();
        let context = domain(&source).create_context();
        let graph = Graph::load(&context);
        let mut expected = Expected::seeded();

        for edit in &edits {
            graph.apply(&context, edit, &mut expected);
            let ids = explicit_ids(&context);
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]), "unordered ids {:?}", ids);
        }
        prop_assert_eq!(graph.observe(&context), expected);
    }

    #[test]
    fn prop_commit_lands_the_final_state(edits in prop::collection::vec(edit(), 1..16)) {
        let source = seeded();
        let domain = domain(&source);
        let context = domain.create_context();
        let graph = Graph::load(&context);
        let mut expected = Expected::seeded();
        for edit in &edits {
            graph.apply(&context, edit, &mut expected);
        }

        context.commit_changes().unwrap();
        prop_assert!(!context.has_changes());
        prop_assert_eq!(source.rows("ARTIST_GROUP").len(), expected.members.iter().filter(|m| **m).count());

        let fresh = domain.create_context();
        let reloaded = Graph::load(&fresh);
        prop_assert_eq!(reloaded.observe(&fresh), expected);
    }

    #[test]
    fn prop_rollback_restores_the_loaded_state(edits in prop::collection::vec(edit(), 1..16)) {
        let source = seeded();
        let context = domain(&source).create_context();
        let graph = Graph::load(&context);
        let mut scratch = Expected::seeded();
        for edit in &edits {
            graph.apply(&context, edit, &mut scratch);
        }

        context.rollback_changes().unwrap();
        prop_assert!(!context.has_changes());
        prop_assert!(source.statements().is_empty());
        prop_assert_eq!(graph.observe(&context), Expected::seeded());
    }
}
