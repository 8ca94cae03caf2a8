mod common;

use common::*;
use itertools::Itertools;
use tessera::*;

struct States {
    world: World,
    state: Entity,
    walking: Entity,
    running: Entity,
    ids: Vec<Entity>,
}

fn states() -> States {
    let mut world = World::new();
    let state = world.create();
    world.set_traits(state, IdTraits::UNION).unwrap();

    let walking = world.create();
    let running = world.create();

    let ids = (0..4)
        .map(|i| {
            let id = world.create();
            let target = if i % 2 == 0 { walking } else { running };
            world.add(id, Id::pair(state, target)).unwrap();
            id
        })
        .collect_vec();

    States {
        world,
        state,
        walking,
        running,
        ids,
    }
}

#[test]
fn targets_share_a_table() {
    init_tracing();
    let States {
        mut world,
        state,
        walking,
        running,
        ids,
    } = states();

    let table = world.table_of(ids[0]).unwrap();
    assert!(ids.iter().all(|&id| world.table_of(id).unwrap() == table));
    assert_eq!(world.ids(ids[0]).unwrap(), [Id::pair(state, UNION)]);

    assert_eq!(world.target(ids[0], state, 0), Some(walking));
    assert_eq!(world.target(ids[1], state, 0), Some(running));
    assert_eq!(world.target(ids[1], state, 1), None);
    assert!(world.has(ids[0], Id::pair(state, walking)));
    assert!(!world.has(ids[0], Id::pair(state, running)));
    assert!(world.has(ids[0], Id::wildcard_of(state)));

    // Switching targets does not move the entity
    world.add(ids[0], Id::pair(state, running)).unwrap();
    assert_eq!(world.table_of(ids[0]).unwrap(), table);
    assert_eq!(world.target(ids[0], state, 0), Some(running));

    // Removing a target which is not the current one does nothing
    world.remove(ids[0], Id::pair(state, walking)).unwrap();
    assert!(world.has(ids[0], Id::pair(state, running)));

    world.remove(ids[0], Id::pair(state, running)).unwrap();
    assert!(!world.has(ids[0], Id::wildcard_of(state)));
    assert!(world.ids(ids[0]).unwrap().is_empty());
}

#[test]
fn targets_survive_migration() {
    let States {
        mut world,
        state,
        walking,
        running,
        ids,
    } = states();

    let tag = world.create();
    world.add(ids[0], tag).unwrap();
    assert_ne!(world.table_of(ids[0]), world.table_of(ids[2]));
    assert_eq!(world.target(ids[0], state, 0), Some(walking));

    // The row swapped into the vacated slot keeps its own target
    assert_eq!(world.record(ids[3]).unwrap().row(), 0);
    assert_eq!(world.target(ids[3], state, 0), Some(running));
    assert_eq!(world.target(ids[2], state, 0), Some(walking));
}

#[test]
fn query_union() {
    let States {
        mut world,
        state,
        walking,
        running,
        ids,
    } = states();

    // A concrete target yields runs of rows
    let mut query = Query::new(&world, [Term::new(Id::pair(state, walking))]).unwrap();
    let batches = query
        .iter(&world)
        .map(|batch| (batch.entities().to_vec(), batch.pair_target(0)))
        .collect_vec();

    assert_eq!(
        batches,
        [
            (vec![ids[0]], Some(walking)),
            (vec![ids[2]], Some(walking)),
        ]
    );
    for batch in query.iter(&world) {
        assert_eq!(batch.id(0), Id::pair(state, walking));
    }

    // A wildcard yields every row on its own, with its target
    let mut query = Query::new(&world, [Term::new(Id::wildcard_of(state))]).unwrap();
    let rows = query
        .iter(&world)
        .map(|batch| {
            assert_eq!(batch.count(), 1);
            let target = batch.pair_target(0).unwrap();
            assert_eq!(batch.id(0), Id::pair(state, target));
            (batch.entity(0).unwrap(), target)
        })
        .collect_vec();

    assert_eq!(
        rows,
        [
            (ids[0], walking),
            (ids[1], running),
            (ids[2], walking),
            (ids[3], running),
        ]
    );

    // Any matches the whole table at once
    let mut query = Query::new(&world, [Term::new(Id::pair(state, ANY))]).unwrap();
    let batch_sizes = query.iter(&world).map(|v| v.count()).collect_vec();
    assert_eq!(batch_sizes, [4]);
    for batch in query.iter(&world) {
        assert_eq!(batch.id(0), Id::pair(state, UNION));
    }

    for &id in &ids {
        world.add(id, Id::pair(state, walking)).unwrap();
    }

    let mut query = Query::new(&world, [Term::new(Id::pair(state, walking))]).unwrap();
    let batch_sizes = query.iter(&world).map(|v| v.count()).collect_vec();
    assert_eq!(batch_sizes, [4]);

    let mut query = Query::new(
        &world,
        [Term::new(Id::wildcard_of(state)).oper(Oper::Not)],
    )
    .unwrap();
    assert!(!query.entities(&world).iter().any(|v| ids.contains(v)));
}

#[test]
fn deleting_a_target() {
    let States {
        mut world,
        state,
        walking,
        running,
        ids,
    } = states();

    world.delete(walking).unwrap();

    assert!(!world.has(ids[0], Id::wildcard_of(state)));
    assert!(!world.has(ids[2], Id::wildcard_of(state)));
    assert_eq!(world.target(ids[1], state, 0), Some(running));
    assert_eq!(world.target(ids[3], state, 0), Some(running));

    let cascading = world.create();
    world
        .set_traits(cascading, IdTraits::UNION | IdTraits::CASCADE)
        .unwrap();

    world.add(ids[0], Id::pair(cascading, running)).unwrap();
    world.delete(running).unwrap();

    assert!(!world.is_alive(ids[0]));
    assert!(world.is_alive(ids[1]));
    assert!(!world.has(ids[1], Id::wildcard_of(state)));
}

#[test]
fn rejected_shapes() {
    let States { world, state, walking, .. } = states();

    let shapes = [
        Term::new(Id::pair(state, walking)).oper(Oper::Not),
        Term::new(Id::pair(state, walking)).oper(Oper::Optional),
        Term::new(Id::wildcard_of(state)).var("x"),
        Term::new(Id::wildcard_of(state)).up(CHILD_OF),
        Term::new(Id::wildcard_of(CHILD_OF)).up(state),
    ];

    for term in shapes {
        let err = Query::new(&world, [term.clone()]).unwrap_err();
        assert!(
            matches!(err, Error::InvalidQueryShape { term: 0, .. }),
            "{term:?} was accepted"
        );
    }
}
