//! End-to-end run of a small library service: book models, a books
//! collection, and the set/new/delete calls that keep them in sync.

use parking_lot::Mutex;
use res_service::handler::access_granted;
use res_service::mock::MockTransport;
use res_service::{
    HandlerResult, HandlerSet, InboundMessage, Ref, Request, Service, ServiceHandle,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
struct Book {
    id: u64,
    title: String,
    author: String,
}

struct Library {
    books: HashMap<String, Book>,
    order: Vec<Ref>,
    next_id: u64,
}

impl Library {
    fn seeded() -> Self {
        let mut library = Library {
            books: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
        };
        library.add("Animal Farm", "George Orwell");
        library.add("Brave New World", "Aldous Huxley");
        library.add("Coraline", "Neil Gaiman");
        library
    }

    fn add(&mut self, title: &str, author: &str) -> Ref {
        let id = self.next_id;
        self.next_id += 1;
        let rid = format!("library.book.{id}");
        self.books.insert(
            rid.clone(),
            Book {
                id,
                title: title.to_string(),
                author: author.to_string(),
            },
        );
        let rid = Ref::new(rid);
        self.order.push(rid.clone());
        rid
    }
}

type Shared = Arc<Mutex<Library>>;

#[derive(Deserialize)]
struct SetParams {
    title: Option<String>,
    author: Option<String>,
}

#[derive(Deserialize)]
struct NewParams {
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
}

#[derive(Deserialize)]
struct DeleteParams {
    id: u64,
}

async fn get_book(r: Request, library: Shared) -> HandlerResult {
    let book = library.lock().books.get(r.resource_name()).cloned();
    match book {
        Some(book) => r.model(book),
        None => r.not_found(),
    }
}

async fn set_book(r: Request, library: Shared) -> HandlerResult {
    let params: SetParams = r.parse_params()?;
    let mut changed = Map::new();
    {
        let mut library = library.lock();
        let Some(book) = library.books.get_mut(r.resource_name()) else {
            return r.not_found();
        };

        if let Some(title) = params.title {
            let title = title.trim();
            if title.is_empty() {
                return r.invalid_params("Title must not be empty");
            }
            if title != book.title {
                book.title = title.to_string();
                changed.insert("title".into(), json!(title));
            }
        }
        if let Some(author) = params.author {
            let author = author.trim();
            if author.is_empty() {
                return r.invalid_params("Author must not be empty");
            }
            if author != book.author {
                book.author = author.to_string();
                changed.insert("author".into(), json!(author));
            }
        }
    }

    r.change_event(&changed)?;
    r.ok(())
}

async fn get_books(r: Request, library: Shared) -> HandlerResult {
    let order = library.lock().order.clone();
    r.collection(order)
}

async fn new_book(r: Request, library: Shared) -> HandlerResult {
    let params: NewParams = r.parse_params()?;
    let (title, author) = (params.title.trim(), params.author.trim());
    if title.is_empty() || author.is_empty() {
        return r.invalid_params("Must provide both title and author");
    }

    let (rid, idx) = {
        let mut library = library.lock();
        let idx = library.order.len();
        (library.add(title, author), idx)
    };
    r.add_event(&rid, idx)?;
    r.new_resource(rid)
}

async fn delete_book(r: Request, library: Shared) -> HandlerResult {
    let params: DeleteParams = r.parse_params()?;
    let rid = format!("library.book.{}", params.id);
    let removed = {
        let mut library = library.lock();
        library.books.remove(&rid);
        let idx = library.order.iter().position(|b| b.as_str() == rid);
        if let Some(idx) = idx {
            library.order.remove(idx);
        }
        idx
    };
    if let Some(idx) = removed {
        r.remove_event(idx)?;
    }
    // Deleting a missing book still succeeds.
    r.ok(())
}

fn library_service(library: Shared) -> Service {
    let mut service = Service::new("library");
    let (get, set) = (library.clone(), library.clone());
    service
        .handle(
            "book.$id",
            HandlerSet::new()
                .access(access_granted)
                .get_model(move |r| get_book(r, get.clone()))
                .set(move |r| set_book(r, set.clone()))
                .group("library"),
        )
        .unwrap();

    let (list, create, delete) = (library.clone(), library.clone(), library);
    service
        .handle(
            "books",
            HandlerSet::new()
                .access(access_granted)
                .get_collection(move |r| get_books(r, list.clone()))
                .call("new", move |r| new_book(r, create.clone()))
                .call("delete", move |r| delete_book(r, delete.clone()))
                .group("library"),
        )
        .unwrap();
    service
}

struct Client {
    handle: ServiceHandle,
    transport: Arc<MockTransport>,
    next: usize,
}

impl Client {
    fn new() -> Self {
        res_service::tracing::setup_tracing();
        let transport = MockTransport::new();
        let handle = library_service(Arc::new(Mutex::new(Library::seeded()))).start(transport.clone());
        Client {
            handle,
            transport,
            next: 0,
        }
    }

    async fn send(&mut self, subject: &str, payload: Value) -> Value {
        self.next += 1;
        let reply = format!("_INBOX.{}", self.next);
        self.handle
            .dispatch(InboundMessage::new(subject, reply.clone(), payload.to_string()));
        let msg = self.transport.wait_for(&reply).await;
        serde_json::from_slice(&msg.payload).unwrap()
    }

    async fn call(&mut self, rid: &str, method: &str, params: Value) -> Value {
        self.send(&format!("call.{rid}.{method}"), json!({ "cid": "c1", "params": params }))
            .await
    }

    async fn event(&self, subject: &str) -> Value {
        let msg = self.transport.wait_for(subject).await;
        serde_json::from_slice(&msg.payload).unwrap()
    }
}

#[tokio::test]
async fn test_get_models_and_collection() {
    let mut client = Client::new();

    let access = client.send("access.library.books", json!({ "cid": "c1" })).await;
    assert_eq!(access, json!({ "result": { "get": true, "call": "*" } }));

    let books = client.send("get.library.books", json!({})).await;
    assert_eq!(
        books,
        json!({ "result": { "collection": [
            { "rid": "library.book.1" },
            { "rid": "library.book.2" },
            { "rid": "library.book.3" }
        ] } })
    );

    let book = client.send("get.library.book.2", json!({})).await;
    assert_eq!(
        book,
        json!({ "result": { "model": { "id": 2, "title": "Brave New World", "author": "Aldous Huxley" } } })
    );

    let missing = client.send("get.library.book.99", json!({})).await;
    assert_eq!(missing["error"]["code"], "system.notFound");
    client.handle.shutdown().await;
}

#[tokio::test]
async fn test_set_sends_change_event_with_changed_fields_only() {
    let mut client = Client::new();

    let reply = client
        .call("library.book.1", "set", json!({ "title": " Animal Farm ", "author": "G. Orwell" }))
        .await;
    assert_eq!(reply, json!({ "result": null }));
    assert_eq!(client.event("event.library.book.1.change").await, json!({ "author": "G. Orwell" }));

    let invalid = client.call("library.book.1", "set", json!({ "title": "  " })).await;
    assert_eq!(
        invalid,
        json!({ "error": { "code": "system.invalidParams", "message": "Title must not be empty" } })
    );

    // Nothing changed, so no second change event.
    client.call("library.book.1", "set", json!({ "author": "G. Orwell" })).await;
    client.handle.shutdown().await;
    assert_eq!(client.transport.count("event.library.book.1.change"), 1);
}

#[tokio::test]
async fn test_new_and_delete_keep_collection_in_sync() {
    let mut client = Client::new();

    let created = client
        .call("library.books", "new", json!({ "title": "Dune", "author": "Frank Herbert" }))
        .await;
    assert_eq!(created, json!({ "result": { "rid": "library.book.4" } }));
    assert_eq!(
        client.event("event.library.books.add").await,
        json!({ "value": { "rid": "library.book.4" }, "idx": 3 })
    );

    let book = client.send("get.library.book.4", json!({})).await;
    assert_eq!(book["result"]["model"]["title"], "Dune");

    let incomplete = client.call("library.books", "new", json!({ "title": "Untitled" })).await;
    assert_eq!(incomplete["error"]["message"], "Must provide both title and author");

    let deleted = client.call("library.books", "delete", json!({ "id": 2 })).await;
    assert_eq!(deleted, json!({ "result": null }));
    assert_eq!(client.event("event.library.books.remove").await, json!({ "idx": 1 }));

    let books = client.send("get.library.books", json!({})).await;
    assert_eq!(
        books["result"]["collection"],
        json!([
            { "rid": "library.book.1" },
            { "rid": "library.book.3" },
            { "rid": "library.book.4" }
        ])
    );

    // Idempotent: deleting again succeeds without a remove event.
    assert_eq!(client.call("library.books", "delete", json!({ "id": 2 })).await, json!({ "result": null }));
    client.handle.shutdown().await;
    assert_eq!(client.transport.count("event.library.books.remove"), 1);
}
