// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/bin/lampwatch_roi.rs - 生成 ROI 文件
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lampwatch::{
  photometry::{Sampler, SamplerConfig},
  roi::{Roi, RoiSet},
};

/// 把矩形列表写入 ROI 文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输出的 ROI 文件
  #[arg(long, env = "ROI_FILE", default_value = "rois.json", value_name = "FILE")]
  pub roi_file: PathBuf,

  /// ROI 矩形 x,y,w,h，可重复指定
  #[arg(long = "rect", value_name = "X,Y,W,H", required = true)]
  pub rects: Vec<Roi>,

  /// 帧宽度，与 --height 一起指定时检查 ROI 是否在帧内
  #[arg(long, requires = "height")]
  pub width: Option<u32>,
  #[arg(long, requires = "width")]
  pub height: Option<u32>,

  /// 检查时使用的背景环宽度
  #[arg(long, default_value_t = 12)]
  pub ring_thickness: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let rois = RoiSet::new(args.rects)?;

  if let (Some(width), Some(height)) = (args.width, args.height) {
    let sampler = Sampler::new(SamplerConfig {
      ring_thickness: args.ring_thickness,
      ..SamplerConfig::default()
    });
    for (index, roi) in rois.iter() {
      sampler.check(roi, width, height)?;
      info!("ROI #{} {} 检查通过", index, roi);
    }
  }

  rois.save(&args.roi_file)?;
  info!("共 {} 个 ROI", rois.len());

  Ok(())
}
