//! Concurrent loads of the same category share one origin request.

mod test_data;

use lorekeeper::{Category, RulesStoreApi};
use std::sync::Arc;
use std::time::Duration;
use test_data::{runtime, store_with, CountingLoader};
use tokio::sync::Semaphore;

#[test]
fn test_simultaneous_loads_issue_one_fetch() {
    let loader = Arc::new(CountingLoader::with_spells());
    let store = store_with(loader.clone());
    let rt = runtime();

    let (a, b) = rt.block_on(async {
        futures::join!(store.load_category(Category::Spell), store.load_category(Category::Spell))
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(loader.lists(), 1);
    assert_eq!(loader.fetches(), 3, "one fetch per source");
}

#[test]
fn test_loads_on_separate_threads_share_one_fetch() {
    let gate = Arc::new(Semaphore::new(0));
    let mut loader = CountingLoader::with_spells();
    loader.gate = Some(Arc::clone(&gate));
    let loader = Arc::new(loader);
    let store = store_with(loader.clone());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let first = tokio::spawn({
            let store = store.clone();
            async move { store.load_category(Category::Spell).await }
        });
        // wait until the first load is parked inside the origin
        while loader.lists() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let second = tokio::spawn({
            let store = store.clone();
            async move { store.load_category(Category::Spell).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(16);

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    });

    assert_eq!(loader.lists(), 1);
    assert_eq!(loader.fetches(), 3);
}

#[test]
fn test_failed_load_is_retried_by_next_caller() {
    let loader = CountingLoader::with_spells();
    loader.fail_listings.store(1, std::sync::atomic::Ordering::SeqCst);
    let loader = Arc::new(loader);
    let store = store_with(loader.clone());
    let rt = runtime();

    assert!(rt.block_on(store.load_category(Category::Spell)).is_none());
    assert!(store.search("shield", Some(Category::Spell)).is_empty());

    let generation = rt.block_on(store.load_category(Category::Spell)).unwrap();
    assert_eq!(generation.len(), 5);
    assert_eq!(loader.lists(), 2);
    assert!(!store.search("shield", Some(Category::Spell)).is_empty());
}

#[test]
fn test_loaded_category_is_served_from_registry() {
    let loader = Arc::new(CountingLoader::with_spells());
    let store = store_with(loader.clone());
    let rt = runtime();

    let first = rt.block_on(store.load_category(Category::Spell)).unwrap();
    let second = rt.block_on(store.load_category(Category::Spell)).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.lists(), 1);
}

#[test]
fn test_shared_source_files_are_fetched_once() {
    let loader = Arc::new(CountingLoader::with_spells());
    let store = store_with(loader.clone());
    let rt = runtime();

    let (a, b, _) = rt.block_on(async {
        futures::join!(
            store.load_source_data(Category::Spell, "PHB"),
            store.load_source_data(Category::Spell, "PHB"),
            store.initialize()
        )
    });
    assert_eq!(a.unwrap().len(), 3);
    assert_eq!(b.unwrap().len(), 3);
    assert_eq!(loader.fetches(), 1);
}
