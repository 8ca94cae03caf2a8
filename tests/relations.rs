mod common;

use common::*;
use itertools::Itertools;
use tessera::*;

#[test]
fn relations() {
    init_tracing();
    let mut world = World::new();
    let likes = world.create();

    let parent = world.create();
    let parent2 = world.create();
    let child1 = world.create();
    let child2 = world.create();

    world.add(child1, Id::pair(CHILD_OF, parent)).unwrap();
    world.add(child2, Id::pair(CHILD_OF, parent)).unwrap();
    world.add(child1, Id::pair(likes, parent)).unwrap();
    world.add(child1, Id::pair(likes, parent2)).unwrap();

    assert!(world.has(child1, Id::pair(CHILD_OF, parent)));
    assert!(world.has(child1, Id::wildcard_of(likes)));
    assert!(world.has(child2, Id::wildcard_to(parent)));
    assert!(!world.has(parent, Id::wildcard_of(CHILD_OF)));

    assert_eq!(world.target(child1, CHILD_OF, 0), Some(parent));
    let liked = (0..)
        .map_while(|i| world.target(child1, likes, i))
        .sorted()
        .collect_vec();
    assert_eq!(liked, [parent, parent2]);

    // ChildOf is exclusive
    world.add(child1, Id::pair(CHILD_OF, parent2)).unwrap();
    assert!(world.has(child1, Id::pair(CHILD_OF, parent2)));
    assert!(!world.has(child1, Id::pair(CHILD_OF, parent)));

    world.remove(child1, Id::wildcard_of(likes)).unwrap();
    assert!(!world.has(child1, Id::wildcard_of(likes)));
    assert!(world.has(child1, Id::pair(CHILD_OF, parent2)));
}

#[test]
fn delete_cleans_references() {
    let mut world = World::new();
    let likes = world.create();
    let tag = world.create();

    let a = world.create();
    let b = world.create();

    world.add(a, Id::pair(likes, b)).unwrap();
    world.add(a, tag).unwrap();
    world.add(b, tag).unwrap();

    world.delete(b).unwrap();
    assert!(world.is_alive(a));
    assert!(!world.has(a, Id::wildcard_of(likes)));
    assert!(world.has(a, tag));

    // Deleting the relationship itself removes every pair of it
    let c = world.create();
    world.add(a, Id::pair(likes, c)).unwrap();
    world.delete(likes).unwrap();
    assert!(world.is_alive(c));
    assert_eq!(world.ids(a).unwrap(), [Id::from(tag)]);

    world.delete(tag).unwrap();
    assert!(world.ids(a).unwrap().is_empty());
}

#[test]
fn cascade() {
    let mut world = World::new();

    let root = world.create();
    let child = world.create();
    let grandchild = world.create();
    let other = world.create();

    world.add(child, Id::pair(CHILD_OF, root)).unwrap();
    world.add(grandchild, Id::pair(CHILD_OF, child)).unwrap();
    world.add(other, Id::pair(IS_A, root)).unwrap();

    world.delete(root).unwrap();

    assert!(!world.is_alive(root));
    assert!(!world.is_alive(child));
    assert!(!world.is_alive(grandchild));

    // IsA does not cascade
    assert!(world.is_alive(other));
    assert!(!world.has(other, Id::wildcard_of(IS_A)));
}

#[test]
fn delete_recursive() {
    let mut world = World::new();
    let owns = world.create();

    let a = world.create();
    let b = world.create();
    let c = world.create();
    let d = world.create();

    world.add(b, Id::pair(owns, a)).unwrap();
    world.add(c, Id::pair(owns, b)).unwrap();
    world.add(d, Id::pair(owns, a)).unwrap();

    let unrelated = world.create();

    world.delete_recursive(b, owns).unwrap();
    assert!(!world.is_alive(b));
    assert!(!world.is_alive(c));
    assert!(world.is_alive(a));
    assert!(world.is_alive(d));
    assert!(world.is_alive(unrelated));

    world.delete_recursive(a, owns).unwrap();
    assert!(!world.is_alive(d));
}

#[test]
fn final_targets() {
    let mut world = World::new();
    let base = world.create();
    world.set_traits(base, IdTraits::FINAL).unwrap();

    let derived = world.create();
    assert_eq!(
        world.add(derived, Id::pair(IS_A, base)),
        Err(Error::FinalOverride {
            relationship: IS_A,
            target: base
        })
    );

    assert!(!world.has(derived, Id::wildcard_of(IS_A)));
}

#[test]
fn traits_are_fixed_once_used() {
    let mut world = World::new();
    let rel = world.create();
    let target = world.create();
    let id = world.create();

    world.set_traits(rel, IdTraits::EXCLUSIVE).unwrap();
    world.add(id, Id::pair(rel, target)).unwrap();

    assert!(matches!(
        world.set_traits(rel, IdTraits::TRANSITIVE),
        Err(Error::InconsistentComponentInfo { .. })
    ));

    // Setting the same traits again is fine
    world.set_traits(rel, IdTraits::EXCLUSIVE).unwrap();
    assert_eq!(world.traits(rel), IdTraits::EXCLUSIVE);
}

#[test]
fn relation_data() {
    let mut world = World::new();
    let distance = world.component::<f32>();

    let a = world.create();
    let b = world.create();
    let c = world.create();

    world.set(a, distance.of(b), 1.5).unwrap();
    world.set(a, distance.of(c), 4.0).unwrap();

    assert_eq!(*world.get(a, distance.of(b)).unwrap(), 1.5);
    assert_eq!(*world.get(a, distance.of(c)).unwrap(), 4.0);

    world.delete(b).unwrap();
    assert!(!world.has(a, distance.of(b)));
    assert_eq!(*world.get(a, distance.of(c)).unwrap(), 4.0);
}

#[test]
fn invalid_ids() {
    let mut world = World::new();
    let a = world.create();
    let dead = world.create();
    world.delete(dead).unwrap();

    assert_eq!(world.add(a, dead), Err(Error::NotAlive(dead)));
    assert!(matches!(
        world.add(a, Id::wildcard_of(CHILD_OF)),
        Err(Error::InconsistentComponentInfo { .. })
    ));
    assert!(matches!(
        world.add(a, Id::pair(CHILD_OF, UNION)),
        Err(Error::InconsistentComponentInfo { .. })
    ));
}

#[test]
fn pairs_refer_to_indices() {
    let mut world = World::new();
    let likes = world.create();
    let a = world.create();

    let stale = world.create();
    world.delete(stale).unwrap();

    // A pair of a dead target with a free index is rejected
    assert_eq!(
        world.add(a, Id::pair(likes, stale)),
        Err(Error::NotAlive(Entity::from_parts(stale.index(), 0)))
    );

    // Once the index is reused the pair refers to the new entity
    let recycled = world.create();
    assert_eq!(recycled.index(), stale.index());
    assert_eq!(Id::pair(likes, stale), Id::pair(likes, recycled));

    world.add(a, Id::pair(likes, stale)).unwrap();
    assert_eq!(world.target(a, likes, 0), Some(recycled));
}
