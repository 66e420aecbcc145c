// 平台相关功能的模块入口

// 内存保护操作：读取和修改页面权限，刷新指令缓存
pub mod memory;
