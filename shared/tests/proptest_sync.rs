use proptest::prelude::*;
use std::sync::Arc;

use taskbox::capabilities::MemoryKvStore;
use taskbox::testing::FakeRemote;
use taskbox::{Event, TaskSync};

#[derive(Debug, Clone)]
enum Mutation {
    Add(String),
    Toggle(usize),
    Rename(usize, String),
    Delete(usize),
}

fn mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Mutation::Add),
        any::<usize>().prop_map(Mutation::Toggle),
        (any::<usize>(), "[a-z]{1,8}").prop_map(|(i, t)| Mutation::Rename(i, t)),
        any::<usize>().prop_map(Mutation::Delete),
    ]
}

// The view lists new tasks first while the server appends them, so only
// the contents are compared.
fn summary(tasks: &[taskbox::Task]) -> Vec<(String, bool)> {
    let mut summary: Vec<_> = tasks
        .iter()
        .map(|t| (t.title.clone(), t.completed))
        .collect();
    summary.sort();
    summary
}

async fn run(seeded: usize, mutations: Vec<Mutation>) -> Result<(), TestCaseError> {
    let remote = Arc::new(FakeRemote::new());
    for i in 0..seeded {
        remote.insert_task(&format!("seed{i}"), i % 2 == 0);
    }
    let sync = TaskSync::new(
        remote.clone(),
        Arc::new(MemoryKvStore::new()),
        remote.config(),
        true,
    )
    .unwrap();
    sync.update(Event::Started).await.unwrap();
    sync.update(Event::NetworkStatusChanged { online: false })
        .await
        .unwrap();

    for mutation in mutations {
        let ids: Vec<_> = sync.tasks().into_iter().filter_map(|t| t.id).collect();
        let pick = |i: usize| ids.get(i % ids.len().max(1)).cloned();
        let event = match mutation {
            Mutation::Add(title) => Some(Event::AddTask { title }),
            Mutation::Toggle(i) => pick(i).map(|id| Event::ToggleTask { id }),
            Mutation::Rename(i, title) => pick(i).map(|id| Event::RenameTask { id, title }),
            Mutation::Delete(i) => pick(i).map(|id| Event::DeleteTask { id }),
        };
        if let Some(event) = event {
            sync.update(event).await.unwrap();
        }
    }
    let expected = summary(&sync.tasks());

    sync.update(Event::NetworkStatusChanged { online: true })
        .await
        .unwrap();

    prop_assert!(sync.pending().is_empty().await.unwrap());
    prop_assert_eq!(sync.tasks(), remote.tasks());
    prop_assert_eq!(summary(&remote.tasks()), expected);
    prop_assert!(remote
        .requests()
        .iter()
        .all(|r| !r.url.contains("/p_")));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn offline_mutations_converge_after_reconnect(
        seeded in 0usize..4,
        mutations in proptest::collection::vec(mutation(), 0..16),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run(seeded, mutations))?;
    }
}
