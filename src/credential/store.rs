use crate::credential::types::{Credential, CredentialDescriptor, CredentialId};
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

pub const CREDENTIALS_FILE: &str = "credentials.json";

/// credentials.json 的读写。内存中保存一份有序描述列表，任何修改后整体写回。
#[derive(Debug)]
pub struct Store {
    file_path: PathBuf,
    state: RwLock<Vec<CredentialDescriptor>>,
}

impl Store {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            file_path: data_dir.as_ref().join(CREDENTIALS_FILE),
            state: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// 从磁盘读取并返回规范化后的 Key 列表；文件不存在视为空列表。
    pub async fn load(&self) -> anyhow::Result<Vec<Credential>> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state.write().await.clear();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).context("读取 credentials.json 失败"),
        };

        let descriptors: Vec<CredentialDescriptor> = sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 credentials.json 失败")?;

        let credentials = normalize(descriptors);
        {
            let mut state = self.state.write().await;
            *state = credentials.iter().map(Credential::to_descriptor).collect();
        }
        Ok(credentials)
    }

    pub async fn get_all(&self) -> Vec<Credential> {
        let state = self.state.read().await;
        state
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, d)| Credential::from_descriptor(d, i))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.len()
    }

    /// 新增或按 id 覆盖（覆盖时保留原 created_at）。返回规范化后的 Key。
    pub async fn add(&self, desc: CredentialDescriptor) -> anyhow::Result<Credential> {
        if desc.secret.trim().is_empty() {
            return Err(anyhow!("secret 不能为空"));
        }

        let (credential, snapshot) = {
            let mut state = self.state.write().await;
            let credential = Credential::from_descriptor(desc, state.len());
            let mut next = credential.to_descriptor();

            match state.iter_mut().find(|d| d.id == credential.id) {
                Some(existing) => {
                    next.created_at = existing.created_at;
                    *existing = next;
                }
                None => state.push(next),
            }
            (credential, state.clone())
        };

        self.save_snapshot(&snapshot).await?;
        Ok(credential)
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.len();
            state.retain(|d| d.id != id);
            if state.len() == before {
                return Err(anyhow!("未找到 Key: {id}"));
            }
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let entry = state
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| anyhow!("未找到 Key: {id}"))?;
            entry.enabled = enabled;
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    async fn save_snapshot(&self, descriptors: &[CredentialDescriptor]) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let data =
            sonic_rs::to_vec_pretty(descriptors).context("序列化 credentials.json 失败")?;
        tokio::fs::write(&self.file_path, data)
            .await
            .context("写入 credentials.json 失败")
    }
}

/// 补齐默认值；重复的 id 只保留第一个。
fn normalize(descriptors: Vec<CredentialDescriptor>) -> Vec<Credential> {
    let mut seen: std::collections::HashSet<CredentialId> = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(descriptors.len());
    for (i, desc) in descriptors.into_iter().enumerate() {
        let credential = Credential::from_descriptor(desc, i);
        if credential.secret.is_empty() {
            tracing::warn!(key = %credential.label, "忽略 secret 为空的 Key");
            continue;
        }
        if !seen.insert(credential.id.clone()) {
            tracing::warn!(key = %credential.id, "忽略重复的 Key id");
            continue;
        }
        out.push(credential);
    }
    out
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
