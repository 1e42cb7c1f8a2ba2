use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use turbo_cache_gateway::object_store::{
    ByteStream, Container, LocalStore, ObjectStore, ObjectStoreError,
};

fn body(chunks: &[&'static str]) -> ByteStream {
    let chunks: Vec<Result<Bytes, std::io::Error>> =
        chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
    Box::pin(stream::iter(chunks))
}

async fn read_all(container: &dyn Container, key: &str) -> Vec<u8> {
    let item = container.item(key).await.unwrap();
    let reader = item.open().await.unwrap();
    let chunks: Vec<Bytes> = reader.stream.try_collect().await.unwrap();
    chunks.concat()
}

#[tokio::test]
async fn test_local_store_put_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    let item = container
        .put("test-key", body(&["hello ", "world"]), Some(11))
        .await
        .unwrap();
    assert_eq!(item.key(), "test-key");
    assert_eq!(item.size(), Some(11));
    assert_eq!(item.metadata().get("size").map(String::as_str), Some("11"));
    assert!(item.url().path().ends_with("/team/test-key"));
    // Host paths stay out of client-visible metadata
    assert!(!item.metadata().contains_key("path"));
    assert!(item
        .metadata()
        .values()
        .all(|v| !v.contains(&*dir.path().to_string_lossy())));

    assert_eq!(read_all(container.as_ref(), "test-key").await, b"hello world");
}

#[tokio::test]
async fn test_local_store_creates_container_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let container = store.container("0123abcd").await.unwrap();
    assert_eq!(container.name(), "0123abcd");
    assert!(dir.path().join("0123abcd").is_dir());

    // Resolving again finds the existing container
    store.container("0123abcd").await.unwrap();
}

#[tokio::test]
async fn test_local_store_rejects_container_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    for name in ["", ".", "..", "a/b"] {
        assert!(matches!(
            store.container(name).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    let result = container.item("missing").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_local_store_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    container.put("key", body(&["first"]), None).await.unwrap();
    container.put("key", body(&["second"]), None).await.unwrap();

    assert_eq!(read_all(container.as_ref(), "key").await, b"second");
}

#[tokio::test]
async fn test_local_store_open_sizes_current_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    container.put("key", body(&["short"]), Some(5)).await.unwrap();
    let item = container.item("key").await.unwrap();
    assert_eq!(item.size(), Some(5));

    // Another writer replaces the key between lookup and open
    container
        .put("key", body(&["a much longer ", "replacement"]), Some(25))
        .await
        .unwrap();

    let reader = item.open().await.unwrap();
    assert_eq!(reader.size, Some(25));
    let chunks: Vec<Bytes> = reader.stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"a much longer replacement");
}

#[tokio::test]
async fn test_local_store_keys_stay_inside_container() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    container
        .put("../escape", body(&["data"]), None)
        .await
        .unwrap();
    container
        .put("nested/key", body(&["nested"]), None)
        .await
        .unwrap();

    assert!(!dir.path().join("escape").exists());
    assert!(!dir.path().join("team").join("nested").exists());
    assert_eq!(read_all(container.as_ref(), "../escape").await, b"data");
    assert_eq!(read_all(container.as_ref(), "nested/key").await, b"nested");

    for key in ["", ".", ".."] {
        assert!(matches!(
            container.item(key).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }
}

#[tokio::test]
async fn test_local_store_rejects_short_body() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    container.put("key", body(&["original"]), None).await.unwrap();

    let result = container.put("key", body(&["trunc"]), Some(100)).await;
    assert!(result.is_err());

    // The previous object is untouched and no upload leftovers remain
    assert_eq!(read_all(container.as_ref(), "key").await, b"original");
    let entries = std::fs::read_dir(dir.path().join("team")).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_local_store_failed_stream_keeps_previous_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    container.put("key", body(&["original"]), None).await.unwrap();

    let failing: ByteStream = Box::pin(
        stream::iter(vec![Ok(Bytes::from_static(b"partial"))]).chain(stream::once(async {
            Err(std::io::Error::other("client went away"))
        })),
    );
    assert!(container.put("key", failing, None).await.is_err());

    assert_eq!(read_all(container.as_ref(), "key").await, b"original");
}

#[tokio::test]
async fn test_local_store_large_object_is_read_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    let container = store.container("team").await.unwrap();

    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let upload: ByteStream = Box::pin(stream::iter(
        data.chunks(8192)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect::<Vec<_>>(),
    ));
    container
        .put("big", upload, Some(data.len() as u64))
        .await
        .unwrap();

    assert_eq!(read_all(container.as_ref(), "big").await, data);
}
