use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

/// 数据变更操作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataOp {
    Set,
    Append,
    Delete,
}

/// 点路径键值存储：flow 数据、runtime 数据与 settings 共用的底座。
/// 支持父级链（execution settings 继承 flow settings 的读取语义）。
pub struct DataStore {
    name: String,
    data: RwLock<Map<String, Value>>,
    parent: Option<Arc<DataStore>>,
}

impl DataStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(Map::new()),
            parent: None,
        }
    }

    pub fn with_parent(name: impl Into<String>, parent: Arc<DataStore>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(Map::new()),
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 自身无值时沿父级链向上读取
    pub fn get(&self, path: &str) -> Option<Value> {
        let own = {
            let data = self.data.read();
            lookup(&data, path).cloned()
        };
        own.or_else(|| self.parent.as_ref().and_then(|parent| parent.get(path)))
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn set(&self, path: &str, value: Value) {
        let mut data = self.data.write();
        write(&mut data, path, value);
    }

    /// 批量写入（每个键都按点路径处理）
    pub fn update(&self, entries: Map<String, Value>) {
        let mut data = self.data.write();
        for (path, value) in entries {
            write(&mut data, &path, value);
        }
    }

    /// 目标是数组则追加；不存在则建新数组；是标量则包一层数组
    pub fn append(&self, path: &str, value: Value) {
        let mut data = self.data.write();
        let current = lookup(&data, path).cloned();
        let next = match current {
            Some(Value::Array(mut items)) => {
                items.push(value);
                Value::Array(items)
            }
            Some(existing) => Value::Array(vec![existing, value]),
            None => Value::Array(vec![value]),
        };
        write(&mut data, path, next);
    }

    pub fn delete(&self, path: &str) {
        let mut data = self.data.write();
        remove(&mut data, path);
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// 自身数据快照（不含父级）
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data.read().clone()
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn write(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            // 中间节点不是对象时覆盖为对象
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => current = map,
            _ => return,
        }
    }
    current.insert(segments[segments.len() - 1].to_string(), value);
}

fn remove(root: &mut Map<String, Value>, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match current.get_mut(*segment).and_then(|value| value.as_object_mut()) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.remove(segments[segments.len() - 1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dot_path_set_and_get() {
        let store = DataStore::new("test");
        store.set("a.b.c", json!(1));
        assert_eq!(store.get("a.b.c"), Some(json!(1)));
        assert_eq!(store.get("a.b"), Some(json!({"c": 1})));
        assert_eq!(store.get("a.missing"), None);
    }

    #[test]
    fn append_wraps_and_extends() {
        let store = DataStore::new("test");
        store.append("list", json!(1));
        store.append("list", json!(2));
        assert_eq!(store.get("list"), Some(json!([1, 2])));

        store.set("scalar", json!("x"));
        store.append("scalar", json!("y"));
        assert_eq!(store.get("scalar"), Some(json!(["x", "y"])));
    }

    #[test]
    fn update_applies_bulk_dot_path_writes() {
        let store = DataStore::new("test");
        let mut entries = Map::new();
        entries.insert("user.name".to_string(), json!("ada"));
        entries.insert("retries".to_string(), json!(3));
        store.update(entries);

        assert_eq!(store.get("user.name"), Some(json!("ada")));
        assert_eq!(store.get("user"), Some(json!({"name": "ada"})));
        assert_eq!(store.get("retries"), Some(json!(3)));
    }

    #[test]
    fn delete_removes_leaf() {
        let store = DataStore::new("test");
        store.set("a.b", json!(true));
        store.set("a.c", json!(false));
        store.delete("a.b");
        assert_eq!(store.get("a"), Some(json!({"c": false})));
        // 删除不存在的路径不报错
        store.delete("a.x.y");
    }

    #[test]
    fn parent_chain_is_read_through() {
        let parent = Arc::new(DataStore::new("parent"));
        parent.set("shared", json!("from-parent"));
        parent.set("masked", json!("parent"));

        let child = DataStore::with_parent("child", Arc::clone(&parent));
        child.set("masked", json!("child"));

        assert_eq!(child.get("shared"), Some(json!("from-parent")));
        assert_eq!(child.get("masked"), Some(json!("child")));
        // 写入只落在子级
        assert_eq!(parent.get("masked"), Some(json!("parent")));
    }
}
