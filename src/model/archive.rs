// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/archive.rs - 模型压缩包解包
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Huishou Authors

use std::io::{Cursor, Read};

use tracing::{debug, info};
use zip::ZipArchive;

use crate::model::{
  ModelError,
  graph::{GRAPH_DESCRIPTOR_NAME, GraphDescriptor},
  loader::{self, ModelPayload, SessionModel},
};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const SESSION_EXTENSION: &str = ".onnx";

pub(crate) fn is_zip(bytes: &[u8]) -> bool {
  bytes.starts_with(ZIP_MAGIC)
}

pub(crate) fn is_session_name(name: &str) -> bool {
  name.to_ascii_lowercase().ends_with(SESSION_EXTENSION)
}

fn base_name(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or(path)
}

fn parent_dir(path: &str) -> &str {
  match path.rfind('/') {
    Some(idx) => &path[..=idx],
    None => "",
  }
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, ModelError> {
  let mut file = archive.by_name(name)?;
  let mut buf = Vec::with_capacity(file.size() as usize);
  file.read_to_end(&mut buf)?;
  Ok(buf)
}

/// 在压缩包中定位模型文件：优先查找名为 `model.json` 的图模型描述，
/// 其次查找扩展名为 `.onnx` 的会话模型；都没有时返回 `None`
pub(crate) fn locate_payload(bytes: &[u8]) -> Result<Option<ModelPayload>, ModelError> {
  let mut archive = ZipArchive::new(Cursor::new(bytes))?;
  let names: Vec<String> = archive
    .file_names()
    .filter(|name| !name.ends_with('/') && !name.starts_with("__MACOSX/"))
    .map(String::from)
    .collect();
  debug!("压缩包包含 {} 个文件: {:?}", names.len(), names);

  if let Some(descriptor_name) = names
    .iter()
    .find(|name| base_name(name) == GRAPH_DESCRIPTOR_NAME)
  {
    info!("在压缩包中找到图模型描述: {}", descriptor_name);
    let descriptor = GraphDescriptor::from_slice(&read_entry(&mut archive, descriptor_name)?)?;
    let dir = parent_dir(descriptor_name).to_string();
    let shards = descriptor
      .shard_paths()
      .map(|path| {
        let full = format!("{}{}", dir, path);
        if names.contains(&full) {
          read_entry(&mut archive, &full)
        } else {
          Err(ModelError::Format(format!("压缩包中缺少权重分片: {}", full)))
        }
      })
      .collect::<Result<Vec<_>, _>>()?;
    return loader::graph_model(descriptor, shards).map(|model| Some(ModelPayload::Graph(model)));
  }

  if let Some(session_name) = names.iter().find(|name| is_session_name(name)) {
    info!("在压缩包中找到会话模型: {}", session_name);
    let bytes = read_entry(&mut archive, session_name)?;
    return Ok(Some(ModelPayload::Session(SessionModel {
      name: base_name(session_name).to_string(),
      bytes,
    })));
  }

  Ok(None)
}
