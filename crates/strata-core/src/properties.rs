use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// 类型擦除的属性值。
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// 按类型查询属性的契约。
///
/// # 设计背景（Why）
/// - 通道、工厂、监听器与绑定元素都需要向外暴露“可选能力”（例如编码器、连接池设置），
///   但调用方事先并不知道栈中哪一层提供该能力；以 `TypeId` 为键查询可以沿栈逐层委托。
///
/// # 契约说明（What）
/// - 未知类型返回 `None`，不得 panic；
/// - 返回值的实际类型必须与 `type_id` 一致，[`PropertySourceExt::get_property`] 依赖这一点完成向下转型。
pub trait PropertySource {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue>;
}

/// 面向调用方的泛型便捷接口。
pub trait PropertySourceExt: PropertySource {
    /// 查询类型为 `T` 的属性。
    fn get_property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.query_property(TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl<S: PropertySource + ?Sized> PropertySourceExt for S {}

/// 以类型为键的属性集合。
///
/// 绑定参数与各层对象的静态属性都以它承载，同一类型至多保存一个值。
#[derive(Clone, Default)]
pub struct PropertyBag {
    entries: HashMap<TypeId, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入值，返回同类型的旧值。
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<Arc<T>> {
        self.insert_arc(Arc::new(value))
    }

    /// 插入已共享的值。
    pub fn insert_arc<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> Option<Arc<T>> {
        self.entries
            .insert(TypeId::of::<T>(), value)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PropertySource for PropertyBag {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        self.entries.get(&type_id).cloned()
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBag")
            .field("len", &self.entries.len())
            .finish()
    }
}
