use tessera::*;

fn rejected(world: &World, terms: impl IntoIterator<Item = Term>) -> Option<usize> {
    match Query::new(world, terms) {
        Err(Error::InvalidQueryShape { term, reason }) => {
            tracing::info!(term, reason, "rejected");
            Some(term)
        }
        Err(err) => panic!("Unexpected error {err}"),
        Ok(_) => None,
    }
}

#[test]
fn rejected_shapes() {
    let mut world = World::new();
    let position = world.component::<glam::Vec2>();
    let likes = world.create();
    let target = world.create();

    assert_eq!(rejected(&world, [Term::new(Id::NULL)]), Some(0));
    assert_eq!(
        rejected(&world, [Term::new(position).src(Source::Fixed(ANY))]),
        Some(0)
    );
    assert_eq!(rejected(&world, [Term::new(position).up(WILDCARD)]), Some(0));
    assert_eq!(
        rejected(
            &world,
            [Term::new(position), Term::new(position).up(CHILD_OF).access(Access::InOut)]
        ),
        Some(1)
    );
    assert_eq!(
        rejected(&world, [Term::new(Id::wildcard_of(likes)).up(CHILD_OF).var("x")]),
        Some(0)
    );
    assert_eq!(
        rejected(&world, [Term::new(Id::pair(likes, target)).var("x")]),
        Some(0)
    );
    assert_eq!(
        rejected(
            &world,
            [
                Term::new(position),
                Term::new(Id::wildcard_of(likes)).var("x").oper(Oper::Not),
            ]
        ),
        Some(1)
    );
}

#[test]
fn accepted_shapes() {
    let mut world = World::new();
    let position = world.component::<glam::Vec2>();
    let likes = world.create();
    let owns = world.create();

    let shapes = [
        vec![],
        vec![Term::new(Id::wildcard_of(CHILD_OF))],
        vec![Term::new(Id::pair(CHILD_OF, ANY))],
        vec![Term::new(Id::pair(WILDCARD, WILDCARD))],
        vec![Term::new(WILDCARD)],
        vec![
            Term::new(Id::wildcard_of(likes)).var("x"),
            Term::new(Id::wildcard_of(owns)).var("x").oper(Oper::Not),
        ],
        vec![
            Term::new(position).self_up(IS_A),
            Term::new(position).src(Source::Fixed(likes)).oper(Oper::Optional),
        ],
    ];

    for terms in shapes {
        assert_eq!(rejected(&world, terms.clone()), None, "{terms:?}");
    }
}

#[test]
fn exclusive_wildcards() {
    let mut world = World::new();
    let parents = (0..3).map(|_| world.create()).collect::<Vec<_>>();
    let children = parents
        .iter()
        .map(|&parent| {
            let child = world.create();
            world.add(child, Id::pair(CHILD_OF, parent)).unwrap();
            child
        })
        .collect::<Vec<_>>();

    let mut query = Query::new(&world, [Term::new(Id::wildcard_of(CHILD_OF))]).unwrap();
    assert_eq!(query.table_count(&world), 3);

    for batch in query.iter(&world) {
        let child = batch.entity(0).unwrap();
        let index = children.iter().position(|&v| v == child).unwrap();
        assert_eq!(batch.pair_target(0), Some(parents[index]));
    }

    // Every entity matches an empty query
    let mut all = Query::new(&world, Vec::new()).unwrap();
    assert_eq!(all.count(&world), world.entity_count());
}
