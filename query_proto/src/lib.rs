tonic::include_proto!("visual_query");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("visual_query");
