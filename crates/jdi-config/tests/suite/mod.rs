mod load_from_path;
