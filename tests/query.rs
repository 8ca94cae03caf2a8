mod common;

use common::*;
use glam::{vec2, Vec2};
use itertools::Itertools;
use pretty_assertions::assert_eq;
use tessera::*;

struct Setup {
    world: World,
    position: Component<Position>,
    velocity: Component<Velocity>,
    e1: Entity,
    e2: Entity,
    e3: Entity,
}

fn setup() -> Setup {
    let mut world = World::new();
    let position = world.component::<Position>();
    let velocity = world.component::<Velocity>();

    let e1 = world.create();
    let e2 = world.create();
    let e3 = world.create();

    world.set(e1, position, Position(vec2(0.0, 0.0))).unwrap();
    world.set(e1, velocity, Velocity(vec2(1.0, 0.0))).unwrap();
    world.set(e2, position, Position(vec2(5.0, 5.0))).unwrap();
    world.set(e2, velocity, Velocity(vec2(0.0, -1.0))).unwrap();
    world.set(e3, position, Position(vec2(2.0, 2.0))).unwrap();

    Setup {
        world,
        position,
        velocity,
        e1,
        e2,
        e3,
    }
}

#[test]
fn query() {
    init_tracing();
    let Setup {
        world,
        position,
        velocity,
        e1,
        e2,
        e3,
    } = setup();

    let mut query = Query::builder()
        .with_mut(position)
        .with(velocity)
        .build(&world)
        .unwrap();

    let entities = query.entities(&world).into_iter().sorted().collect_vec();
    assert_eq!(entities, [e1, e2]);
    assert_eq!(query.table_count(&world), 1);

    for batch in query.iter(&world) {
        let mut pos = batch.field_mut::<Position>(0).unwrap();
        let vel = batch.field::<Velocity>(1).unwrap();
        assert_eq!(pos.len(), batch.count());

        for (pos, vel) in pos.iter_mut().zip(vel.iter()) {
            pos.0 += vel.0;
        }

        // Only writable terms can be borrowed mutably
        assert_eq!(batch.field_mut::<Velocity>(1).err(), Some(Error::InvalidAccess(1)));
        assert!(matches!(
            batch.field::<Vec2>(1),
            Err(Error::MismatchedType { .. })
        ));
    }

    assert_eq!(*world.get(e1, position).unwrap(), Position(vec2(1.0, 0.0)));
    assert_eq!(*world.get(e2, position).unwrap(), Position(vec2(5.0, 4.0)));
    assert_eq!(*world.get(e3, position).unwrap(), Position(vec2(2.0, 2.0)));
}

#[test]
fn optional_and_not() {
    let Setup {
        world,
        position,
        velocity,
        e1,
        e2,
        e3,
    } = setup();

    let mut query = Query::builder()
        .with(position)
        .optional(velocity)
        .build(&world)
        .unwrap();

    let mut seen = Vec::new();
    for batch in query.iter(&world) {
        for &id in batch.entities() {
            seen.push((id, batch.is_set(1)));
        }

        if !batch.is_set(1) {
            assert_eq!(batch.field::<Velocity>(1).err(), Some(Error::InvalidAccess(1)));
        }
    }

    seen.sort();
    assert_eq!(seen, [(e1, true), (e2, true), (e3, false)]);

    let mut without = Query::builder()
        .with(position)
        .without(velocity)
        .build(&world)
        .unwrap();

    assert_eq!(without.entities(&world), [e3]);
}

#[test]
fn only_negated_terms() {
    let Setup {
        mut world,
        velocity,
        ..
    } = setup();

    let tag = world.create();
    let tagged = world.create();
    world.add(tagged, tag).unwrap();

    let mut query = Query::new(&world, [Term::new(tag).oper(Oper::Not)]).unwrap();
    assert_eq!(query.count(&world), world.entity_count() - 1);

    let mut query = Query::new(&world, [Term::new(velocity).oper(Oper::Not), Term::new(tag)]).unwrap();
    assert_eq!(query.entities(&world), [tagged]);
}

#[test]
fn wildcard_pairs() {
    let mut world = World::new();
    let likes = world.create();
    let a = world.create();
    let b = world.create();
    let c = world.create();

    world.add(a, Id::pair(likes, b)).unwrap();
    world.add(a, Id::pair(likes, c)).unwrap();
    world.add(b, Id::pair(likes, c)).unwrap();

    // Every pair is matched on its own
    let mut query = Query::new(&world, [Term::new(Id::wildcard_of(likes))]).unwrap();
    let matches = query
        .iter(&world)
        .flat_map(|batch| {
            let target = batch.pair_target(0).unwrap();
            batch.entities().iter().map(move |&id| (id, target))
        })
        .sorted()
        .collect_vec();

    assert_eq!(matches, [(a, b), (a, c), (b, c)]);

    // `a` passed through `{(likes, b)}`, which stays cached while empty
    assert_eq!(query.table_count(&world), 3);
    world.compact().unwrap();
    assert_eq!(query.table_count(&world), 2);

    for batch in query.iter(&world) {
        if batch.entities() == [a] {
            assert_eq!(batch.targets(0).into_iter().sorted().collect_vec(), [b, c]);
        }
    }

    // Any matches each table once
    let mut query = Query::new(&world, [Term::new(Id::pair(likes, ANY))]).unwrap();
    assert_eq!(query.entities(&world).into_iter().sorted().collect_vec(), [a, b]);

    let mut query = Query::new(&world, [Term::new(Id::wildcard_to(c))]).unwrap();
    assert_eq!(query.entities(&world).into_iter().sorted().collect_vec(), [a, b]);
}

#[test]
fn variables() {
    let mut world = World::new();
    let likes = world.create();
    let owns = world.create();

    let a = world.create();
    let b = world.create();
    let c = world.create();
    let d = world.create();

    world.add(a, Id::pair(likes, b)).unwrap();
    world.add(a, Id::pair(likes, c)).unwrap();
    world.add(a, Id::pair(owns, c)).unwrap();
    world.add(d, Id::pair(likes, b)).unwrap();
    world.add(d, Id::pair(owns, c)).unwrap();

    let mut query = Query::new(
        &world,
        [
            Term::new(Id::wildcard_of(likes)).var("x"),
            Term::new(Id::wildcard_of(owns)).var("x"),
        ],
    )
    .unwrap();

    let matches = query
        .iter(&world)
        .flat_map(|batch| {
            let x = batch.var("x");
            batch.entities().iter().map(move |&id| (id, x))
        })
        .collect_vec();

    assert_eq!(matches, [(a, Some(c))]);

    let err = Query::new(&world, [Term::new(Id::wildcard_of(likes)).var("x").oper(Oper::Optional)])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQueryShape { term: 0, .. }));
}

#[test]
fn shared_from_parent() {
    let mut world = World::new();
    let position = world.component::<Position>();
    let velocity = world.component::<Velocity>();

    let parent = world.create();
    world.set(parent, position, Position(vec2(10.0, 0.0))).unwrap();
    let parent2 = world.create();

    let child = world.create();
    world.add(child, Id::pair(CHILD_OF, parent)).unwrap();
    world.set(child, velocity, Velocity::default()).unwrap();

    let child2 = world.create();
    world.add(child2, Id::pair(CHILD_OF, parent2)).unwrap();
    world.set(child2, velocity, Velocity::default()).unwrap();

    let mut query = Query::new(
        &world,
        [Term::new(velocity), Term::new(position).up(CHILD_OF)],
    )
    .unwrap();

    let mut found = Vec::new();
    for batch in query.iter(&world) {
        let pos = batch.field::<Position>(1).unwrap();
        assert_eq!(pos.len(), 1);
        assert!(!batch.is_self(1));
        for &id in batch.entities() {
            found.push((id, batch.source(1), pos[0]));
        }
    }

    assert_eq!(found, [(child, Some(parent), Position(vec2(10.0, 0.0)))]);

    // Changing the parent is picked up by the cache
    world.set(parent2, position, Position(vec2(0.0, 10.0))).unwrap();
    let entities = query.entities(&world).into_iter().sorted().collect_vec();
    assert_eq!(entities, [child, child2].into_iter().sorted().collect_vec());

    world.remove(parent, position).unwrap();
    assert_eq!(query.entities(&world), [child2]);
}

#[test]
fn inherited() {
    let mut world = World::new();
    let position = world.component::<Position>();

    let base = world.create();
    world.set(base, position, Position(vec2(1.0, 1.0))).unwrap();

    let instance = world.create();
    world.add(instance, Id::pair(IS_A, base)).unwrap();

    let owned = world.create();
    world.add(owned, Id::pair(IS_A, base)).unwrap();
    world.set(owned, position, Position(vec2(2.0, 2.0))).unwrap();

    let mut query = Query::new(&world, [Term::new(position).self_up(IS_A)]).unwrap();

    let mut found = Vec::new();
    for batch in query.iter(&world) {
        let pos = batch.field::<Position>(0).unwrap();
        for (i, &id) in batch.entities().iter().enumerate() {
            let value = if batch.is_self(0) { pos[i] } else { pos[0] };
            found.push((id, batch.source(0), value));
        }
    }

    found.sort_by_key(|v| v.0);
    assert_eq!(
        found,
        [
            (base, None, Position(vec2(1.0, 1.0))),
            (instance, Some(base), Position(vec2(1.0, 1.0))),
            (owned, None, Position(vec2(2.0, 2.0))),
        ]
    );
}

#[test]
fn transitive() {
    let mut world = World::new();
    let animal = world.create();
    let mammal = world.create();
    let dog = world.create();
    let rock = world.create();

    world.add(mammal, Id::pair(IS_A, animal)).unwrap();
    world.add(dog, Id::pair(IS_A, mammal)).unwrap();

    let mut query = Query::new(&world, [Term::new(Id::pair(IS_A, animal))]).unwrap();
    assert_eq!(query.entities(&world).into_iter().sorted().collect_vec(), [mammal, dog]);

    for batch in query.iter(&world) {
        if batch.entities() == [dog] {
            assert_eq!(batch.id(0), Id::pair(IS_A, mammal));
        }
    }

    // Relinking an intermediate entity invalidates the cached matches
    world.remove(mammal, Id::pair(IS_A, animal)).unwrap();
    world.add(mammal, Id::pair(IS_A, rock)).unwrap();
    assert!(query.entities(&world).is_empty());
}

#[test]
fn fixed_source() {
    let Setup {
        mut world,
        position,
        velocity,
        e1,
        e2,
        ..
    } = setup();

    let gravity = world.component::<Vec2>();
    let globals = world.create();

    let mut query = Query::new(
        &world,
        [
            Term::new(velocity),
            Term::new(gravity).src(Source::Fixed(globals)),
        ],
    )
    .unwrap();

    assert_eq!(query.count(&world), 0);

    world.set(globals, gravity, vec2(0.0, -9.8)).unwrap();
    assert_eq!(query.entities(&world).into_iter().sorted().collect_vec(), [e1, e2]);

    for batch in query.iter(&world) {
        assert_eq!(batch.source(1), Some(globals));
        assert_eq!(batch.field::<Vec2>(1).unwrap().to_vec(), [vec2(0.0, -9.8)]);
    }

    let mut negated = Query::new(
        &world,
        [
            Term::new(position),
            Term::new(gravity).src(Source::Fixed(globals)).oper(Oper::Not),
        ],
    )
    .unwrap();

    assert_eq!(negated.count(&world), 0);
    world.remove(globals, gravity).unwrap();
    assert_eq!(negated.count(&world), 3);
}

#[test]
#[should_panic(expected = "not created for")]
fn foreign_world() {
    let Setup { world, position, .. } = setup();
    let other = World::new();

    let mut query = Query::builder().with(position).build(&world).unwrap();
    query.count(&other);
}
